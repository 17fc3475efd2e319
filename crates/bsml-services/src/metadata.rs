//! RDF descriptions of catalogued recordings, served when a client does not
//! ask for sample data.

use std::fmt::Write;

use crate::repository::{RecordingInfo, SignalInfo};

const BSML_NS: &str = "http://www.biosignalml.org/ontologies/2011/04/biosignalml#";
const DCT_NS: &str = "http://purl.org/dc/terms/";
const RDF_NS: &str = "http://www.w3.org/1999/02/22-rdf-syntax-ns#";
const RDFS_NS: &str = "http://www.w3.org/2000/01/rdf-schema#";
const XSD_DOUBLE: &str = "http://www.w3.org/2001/XMLSchema#double";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFormat {
    Turtle,
    RdfXml,
}

impl MetadataFormat {
    pub fn mimetype(self) -> &'static str {
        match self {
            MetadataFormat::Turtle => "text/turtle",
            MetadataFormat::RdfXml => "application/rdf+xml",
        }
    }
}

/// Describe `subject`: the whole recording, or one of its signals.
pub fn describe(recording: &RecordingInfo, subject: &str, format: MetadataFormat) -> String {
    let signals: Vec<&SignalInfo> = match recording.signal(subject) {
        Some(signal) => vec![signal],
        None => recording.signals.iter().collect(),
    };
    let include_recording = subject == recording.uri;
    match format {
        MetadataFormat::Turtle => turtle(recording, include_recording, &signals),
        MetadataFormat::RdfXml => rdf_xml(recording, include_recording, &signals),
    }
}

// ── Turtle ────────────────────────────────────────────────────────────────────

fn turtle(recording: &RecordingInfo, include_recording: bool, signals: &[&SignalInfo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "@prefix bsml: <{BSML_NS}> .");
    let _ = writeln!(out, "@prefix dct: <{DCT_NS}> .");
    let _ = writeln!(out, "@prefix rdfs: <{RDFS_NS}> .");
    let _ = writeln!(out, "@prefix xsd: <http://www.w3.org/2001/XMLSchema#> .");

    if include_recording {
        let _ = write!(
            out,
            "\n<{}> a bsml:Recording ;\n    dct:format \"{}\"",
            iri(&recording.uri),
            literal(&recording.format)
        );
        if let Some(d) = recording.duration {
            let _ = write!(out, " ;\n    bsml:duration \"{d}\"^^xsd:double");
        }
        if let Some(digest) = &recording.digest {
            let _ = write!(out, " ;\n    bsml:digest \"blake3:{digest}\"");
        }
        out.push_str(" .\n");
    }
    for signal in signals {
        let _ = write!(
            out,
            "\n<{}> a bsml:Signal ;\n    bsml:recording <{}> ;\n    rdfs:label \"{}\"",
            iri(&signal.uri),
            iri(&recording.uri),
            literal(&signal.label)
        );
        if let Some(rate) = signal.rate {
            let _ = write!(out, " ;\n    bsml:rate \"{rate}\"^^xsd:double");
        }
        out.push_str(" .\n");
    }
    out
}

fn iri(uri: &str) -> String {
    uri.replace('>', "%3E").replace(' ', "%20")
}

fn literal(text: &str) -> String {
    text.replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ── RDF/XML ───────────────────────────────────────────────────────────────────

fn rdf_xml(recording: &RecordingInfo, include_recording: bool, signals: &[&SignalInfo]) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
    let _ = writeln!(
        out,
        "<rdf:RDF xmlns:rdf=\"{RDF_NS}\" xmlns:rdfs=\"{RDFS_NS}\" xmlns:bsml=\"{BSML_NS}\" xmlns:dct=\"{DCT_NS}\">"
    );
    if include_recording {
        let _ = writeln!(out, "  <bsml:Recording rdf:about=\"{}\">", escape_xml(&recording.uri));
        let _ = writeln!(out, "    <dct:format>{}</dct:format>", escape_xml(&recording.format));
        if let Some(d) = recording.duration {
            let _ = writeln!(
                out,
                "    <bsml:duration rdf:datatype=\"{XSD_DOUBLE}\">{d}</bsml:duration>"
            );
        }
        if let Some(digest) = &recording.digest {
            let _ = writeln!(out, "    <bsml:digest>blake3:{digest}</bsml:digest>");
        }
        out.push_str("  </bsml:Recording>\n");
    }
    for signal in signals {
        let _ = writeln!(out, "  <bsml:Signal rdf:about=\"{}\">", escape_xml(&signal.uri));
        let _ = writeln!(
            out,
            "    <bsml:recording rdf:resource=\"{}\"/>",
            escape_xml(&recording.uri)
        );
        let _ = writeln!(out, "    <rdfs:label>{}</rdfs:label>", escape_xml(&signal.label));
        if let Some(rate) = signal.rate {
            let _ = writeln!(out, "    <bsml:rate rdf:datatype=\"{XSD_DOUBLE}\">{rate}</bsml:rate>");
        }
        out.push_str("  </bsml:Signal>\n");
    }
    out.push_str("</rdf:RDF>\n");
    out
}

/// Escape text for XML content and attribute values.
pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}
