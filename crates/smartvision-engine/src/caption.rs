use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use smartvision_contracts::events::{EventPayload, LogLevel};
use smartvision_contracts::Emitter;
use thiserror::Error;

use crate::iptc::{self, ContainerError, IptcContainer};

static DESCRIPTION_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<dc:description\b[^>]*>(.*?)</dc:description>").unwrap()
});
static DEFAULT_LANG_ENTRY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?s)<rdf:li\s+xml:lang=['"]x-default['"]\s*>(.*?)</rdf:li>"#).unwrap()
});

#[derive(Debug, Error)]
enum CaptionReadError {
    #[error(transparent)]
    Container(#[from] ContainerError),
    #[error("metadata tool `{tool}` failed: {source}")]
    Tool {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Reads descriptive text an image already carries.
///
/// The IPTC caption wins; the default-language XMP description is the fallback. Every
/// read failure is reported as an event and treated as "no caption".
#[derive(Clone)]
pub struct CaptionExtractor {
    exiftool: String,
    events: Emitter,
}

impl CaptionExtractor {
    pub fn new(exiftool: impl Into<String>, events: Emitter) -> Self {
        Self {
            exiftool: exiftool.into(),
            events,
        }
    }

    pub fn extract(&self, path: &Path) -> Option<String> {
        match read_iptc_caption(path) {
            Ok(Some(caption)) => return Some(caption),
            Ok(None) => {}
            Err(err) => self.report_failure(path, "iptc", &err),
        }
        match self.read_xmp_description(path) {
            Ok(found) => found,
            Err(err) => {
                self.report_failure(path, "xmp", &err);
                None
            }
        }
    }

    fn read_xmp_description(&self, path: &Path) -> Result<Option<String>, CaptionReadError> {
        let packet = match Command::new(&self.exiftool)
            .arg("-b")
            .arg("-XMP")
            .arg(path)
            .output()
        {
            Ok(output) => String::from_utf8_lossy(&output.stdout).trim().to_string(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.events.debug(
                    "metadata_tool_missing",
                    format!(
                        "`{}` not found; reading the embedded XMP packet directly",
                        self.exiftool
                    ),
                );
                let bytes = fs::read(path).map_err(|source| CaptionReadError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                iptc::xmp_packet(&bytes).unwrap_or_default()
            }
            Err(source) => {
                return Err(CaptionReadError::Tool {
                    tool: self.exiftool.clone(),
                    source,
                })
            }
        };
        Ok(default_language_description(&packet))
    }

    fn report_failure(&self, path: &Path, reader: &str, err: &CaptionReadError) {
        let mut fields = EventPayload::new();
        fields.insert("path".to_string(), json!(path.display().to_string()));
        fields.insert("reader".to_string(), json!(reader));
        self.events.log(
            LogLevel::Warning,
            "caption_read_failed",
            format!("No {reader} caption read from {}: {err}", path.display()),
            fields,
        );
    }
}

fn read_iptc_caption(path: &Path) -> Result<Option<String>, CaptionReadError> {
    let caption = IptcContainer::read_file(path)?
        .and_then(|container| container.caption())
        .map(|caption| caption.trim().to_string())
        .filter(|caption| !caption.is_empty());
    Ok(caption)
}

/// Default-language entry of the XMP `dc:description`, or of the first localized
/// alternative in the packet when no description block exists.
pub fn default_language_description(xmp: &str) -> Option<String> {
    let scope = DESCRIPTION_BLOCK
        .captures(xmp)
        .and_then(|caps| caps.get(1))
        .map(|found| found.as_str())
        .unwrap_or(xmp);
    DEFAULT_LANG_ENTRY
        .captures(scope)
        .and_then(|caps| caps.get(1))
        .map(|found| unescape_xml(found.as_str().trim()))
        .filter(|text| !text.is_empty())
}

fn unescape_xml(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Arc;

    use smartvision_contracts::events::RecordingSink;
    use smartvision_contracts::Emitter;

    use super::{default_language_description, CaptionExtractor};
    use crate::iptc::tests::{jpeg_with_xmp, minimal_jpeg};
    use crate::iptc::{IptcContainer, CAPTION_ABSTRACT};

    const XMP: &str = r#"<x:xmpmeta><rdf:RDF><rdf:Description>
<dc:title><rdf:Alt><rdf:li xml:lang="x-default">Title text</rdf:li></rdf:Alt></dc:title>
<dc:description><rdf:Alt><rdf:li xml:lang='x-default'> Fog &amp; pines </rdf:li></rdf:Alt></dc:description>
</rdf:Description></rdf:RDF></x:xmpmeta>"#;

    fn extractor(sink: Arc<RecordingSink>) -> CaptionExtractor {
        CaptionExtractor::new("smartvision-missing-exiftool", Emitter::new(sink, "test"))
    }

    #[test]
    fn xmp_description_prefers_dc_description_block() {
        assert_eq!(
            default_language_description(XMP).as_deref(),
            Some("Fog & pines")
        );
    }

    #[test]
    fn xmp_without_description_uses_first_default_entry() {
        let xmp = r#"<rdf:Alt><rdf:li xml:lang="x-default">Only entry</rdf:li></rdf:Alt>"#;
        assert_eq!(
            default_language_description(xmp).as_deref(),
            Some("Only entry")
        );
        assert_eq!(default_language_description("<x:xmpmeta/>"), None);
    }

    #[test]
    fn iptc_caption_takes_priority() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("a.jpg");
        let mut container = IptcContainer::empty();
        container.set(CAPTION_ABSTRACT, "sunset over hills");
        fs::write(&path, container.embed_into(&jpeg_with_xmp(XMP))?)?;

        let sink = Arc::new(RecordingSink::new());
        assert_eq!(
            extractor(sink).extract(&path).as_deref(),
            Some("sunset over hills")
        );
        Ok(())
    }

    #[test]
    fn falls_back_to_embedded_xmp_when_tool_missing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("b.jpg");
        fs::write(&path, jpeg_with_xmp(XMP))?;

        let sink = Arc::new(RecordingSink::new());
        assert_eq!(
            extractor(sink.clone()).extract(&path).as_deref(),
            Some("Fog & pines")
        );
        assert!(sink.kinds().contains(&"metadata_tool_missing".to_string()));
        Ok(())
    }

    #[test]
    fn unreadable_image_yields_none_and_a_warning() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("broken.jpg");
        fs::write(&path, b"not a jpeg at all")?;

        let sink = Arc::new(RecordingSink::new());
        assert_eq!(extractor(sink.clone()).extract(&path), None);
        assert!(sink.kinds().contains(&"caption_read_failed".to_string()));
        Ok(())
    }

    #[test]
    fn plain_jpeg_has_no_caption() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("c.jpg");
        fs::write(&path, minimal_jpeg())?;
        let sink = Arc::new(RecordingSink::new());
        assert_eq!(extractor(sink).extract(&path), None);
        Ok(())
    }
}
