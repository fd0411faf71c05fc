//! Minimal IPTC-IIM metadata container for JPEG files.
//!
//! The container lives in an APP13 `Photoshop 3.0` image-resource block under resource
//! `0x0404`. Segments and resources this module does not understand are carried through
//! untouched; everything after the first SOS marker is copied verbatim.

use std::fs;
use std::path::Path;

use thiserror::Error;

pub const IPTC_RESOURCE_ID: u16 = 0x0404;

const MARKER_SOS: u8 = 0xDA;
const MARKER_EOI: u8 = 0xD9;
const MARKER_APP1: u8 = 0xE1;
const MARKER_APP13: u8 = 0xED;
const PHOTOSHOP_SIGNATURE: &[u8] = b"Photoshop 3.0\0";
const RESOURCE_SIGNATURE: &[u8] = b"8BIM";
const XMP_SIGNATURE: &[u8] = b"http://ns.adobe.com/xap/1.0/\0";
const IIM_TAG_MARKER: u8 = 0x1C;
const MAX_SEGMENT_DATA: usize = 0xFFFF - 2;
const UTF8_CHARSET: &[u8] = b"\x1b%G";
const RECORD_VERSION: &[u8] = &[0x00, 0x04];

/// `(record, dataset)` pair identifying an IIM field.
pub type IptcTag = (u8, u8);

pub const CODED_CHARACTER_SET: IptcTag = (1, 90);
pub const RECORD_VERSION_TAG: IptcTag = (2, 0);
pub const OBJECT_NAME: IptcTag = (2, 5);
pub const KEYWORDS: IptcTag = (2, 25);
pub const BY_LINE: IptcTag = (2, 80);
pub const CAPTION_ABSTRACT: IptcTag = (2, 120);

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("not a JPEG file (missing SOI marker)")]
    NotJpeg,
    #[error("corrupt {0}")]
    Corrupt(&'static str),
    #[error("IPTC block of {0} bytes does not fit in one APP13 segment")]
    TooLarge(usize),
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptcDataset {
    pub record: u8,
    pub dataset: u8,
    pub value: Vec<u8>,
}

/// Ordered list of IIM datasets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IptcContainer {
    datasets: Vec<IptcDataset>,
}

impl IptcContainer {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Reads the IPTC block of a JPEG. `Ok(None)` means the image carries no IPTC data.
    pub fn from_jpeg(bytes: &[u8]) -> Result<Option<Self>, ContainerError> {
        let jpeg = JpegFile::parse(bytes)?;
        let Some(segment) = jpeg.photoshop_segment() else {
            return Ok(None);
        };
        let resources = parse_resources(&segment.data[PHOTOSHOP_SIGNATURE.len()..])?;
        let Some(iptc) = resources.iter().find(|res| res.id == IPTC_RESOURCE_ID) else {
            return Ok(None);
        };
        Ok(Some(Self {
            datasets: parse_datasets(&iptc.data)?,
        }))
    }

    pub fn read_file(path: &Path) -> Result<Option<Self>, ContainerError> {
        let bytes = fs::read(path).map_err(|source| ContainerError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_jpeg(&bytes)
    }

    pub fn get(&self, tag: IptcTag) -> Option<String> {
        self.datasets
            .iter()
            .find(|row| (row.record, row.dataset) == tag)
            .map(|row| decode_text(&row.value))
    }

    pub fn get_all(&self, tag: IptcTag) -> Vec<String> {
        self.datasets
            .iter()
            .filter(|row| (row.record, row.dataset) == tag)
            .map(|row| decode_text(&row.value))
            .collect()
    }

    pub fn remove(&mut self, tag: IptcTag) {
        self.datasets
            .retain(|row| (row.record, row.dataset) != tag);
    }

    pub fn set(&mut self, tag: IptcTag, value: &str) {
        self.set_all(tag, [value]);
    }

    /// Replaces every occurrence of `tag`, keeping the position of the first one.
    pub fn set_all<I, S>(&mut self, tag: IptcTag, values: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let insert_at = self
            .datasets
            .iter()
            .position(|row| (row.record, row.dataset) == tag)
            .unwrap_or(self.datasets.len());
        self.remove(tag);
        let insert_at = insert_at.min(self.datasets.len());
        let rows = values
            .into_iter()
            .map(|value| IptcDataset {
                record: tag.0,
                dataset: tag.1,
                value: value.as_ref().as_bytes().to_vec(),
            })
            .collect::<Vec<_>>();
        self.datasets.splice(insert_at..insert_at, rows);
    }

    pub fn object_name(&self) -> Option<String> {
        self.get(OBJECT_NAME)
    }

    pub fn caption(&self) -> Option<String> {
        self.get(CAPTION_ABSTRACT)
    }

    pub fn keywords(&self) -> Vec<String> {
        self.get_all(KEYWORDS)
    }

    pub fn by_line(&self) -> Option<String> {
        self.get(BY_LINE)
    }

    /// Serialized IIM block; always declares UTF-8 and a record version.
    pub fn to_iim(&self) -> Vec<u8> {
        let mut rows = self.datasets.clone();
        if !rows
            .iter()
            .any(|row| (row.record, row.dataset) == CODED_CHARACTER_SET)
        {
            rows.push(IptcDataset {
                record: CODED_CHARACTER_SET.0,
                dataset: CODED_CHARACTER_SET.1,
                value: UTF8_CHARSET.to_vec(),
            });
        }
        if !rows
            .iter()
            .any(|row| (row.record, row.dataset) == RECORD_VERSION_TAG)
        {
            rows.push(IptcDataset {
                record: RECORD_VERSION_TAG.0,
                dataset: RECORD_VERSION_TAG.1,
                value: RECORD_VERSION.to_vec(),
            });
        }
        rows.sort_by_key(|row| (row.record, row.dataset));

        let mut out = Vec::new();
        for row in rows {
            out.push(IIM_TAG_MARKER);
            out.push(row.record);
            out.push(row.dataset);
            let len = row.value.len();
            if len <= 0x7FFF {
                out.extend_from_slice(&(len as u16).to_be_bytes());
            } else {
                out.extend_from_slice(&0x8004u16.to_be_bytes());
                out.extend_from_slice(&(len as u32).to_be_bytes());
            }
            out.extend_from_slice(&row.value);
        }
        out
    }

    /// Returns a copy of `jpeg` whose IPTC resource is replaced by this container.
    pub fn embed_into(&self, jpeg: &[u8]) -> Result<Vec<u8>, ContainerError> {
        let mut file = JpegFile::parse(jpeg)?;
        let iim = self.to_iim();

        let existing = file
            .segments
            .iter()
            .position(|seg| seg.marker == MARKER_APP13 && seg.data.starts_with(PHOTOSHOP_SIGNATURE));
        let mut resources = match existing {
            // An unreadable resource block is replaced rather than failing the write.
            Some(idx) => parse_resources(&file.segments[idx].data[PHOTOSHOP_SIGNATURE.len()..])
                .unwrap_or_default(),
            None => Vec::new(),
        };
        match resources.iter_mut().find(|res| res.id == IPTC_RESOURCE_ID) {
            Some(res) => res.data = iim,
            None => resources.push(ImageResource {
                id: IPTC_RESOURCE_ID,
                name: Vec::new(),
                data: iim,
            }),
        }

        let mut data = PHOTOSHOP_SIGNATURE.to_vec();
        data.extend_from_slice(&serialize_resources(&resources));
        if data.len() > MAX_SEGMENT_DATA {
            return Err(ContainerError::TooLarge(data.len()));
        }
        let segment = Segment {
            marker: MARKER_APP13,
            data,
            standalone: false,
        };
        match existing {
            Some(idx) => file.segments[idx] = segment,
            None => {
                let insert_at = file
                    .segments
                    .iter()
                    .position(|seg| !(0xE0..=0xEF).contains(&seg.marker))
                    .unwrap_or(file.segments.len());
                file.segments.insert(insert_at, segment);
            }
        }
        Ok(file.to_bytes())
    }

    /// Embeds this container into the JPEG at `path`, rewriting the file.
    pub fn write_file(&self, path: &Path) -> Result<(), ContainerError> {
        let io_err = |source| ContainerError::Io {
            path: path.display().to_string(),
            source,
        };
        let bytes = fs::read(path).map_err(io_err)?;
        let updated = self.embed_into(&bytes)?;
        fs::write(path, updated).map_err(io_err)
    }
}

/// Raw XMP packet stored in an APP1 segment, if any.
pub fn xmp_packet(jpeg: &[u8]) -> Option<String> {
    let file = JpegFile::parse(jpeg).ok()?;
    file.segments
        .iter()
        .find(|seg| seg.marker == MARKER_APP1 && seg.data.starts_with(XMP_SIGNATURE))
        .map(|seg| String::from_utf8_lossy(&seg.data[XMP_SIGNATURE.len()..]).into_owned())
}

fn decode_text(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => bytes.iter().map(|byte| *byte as char).collect(),
    }
}

#[derive(Debug, Clone)]
struct Segment {
    marker: u8,
    data: Vec<u8>,
    standalone: bool,
}

#[derive(Debug, Clone)]
struct JpegFile {
    segments: Vec<Segment>,
    tail: Vec<u8>,
}

impl JpegFile {
    fn parse(bytes: &[u8]) -> Result<Self, ContainerError> {
        if bytes.len() < 2 || bytes[0] != 0xFF || bytes[1] != 0xD8 {
            return Err(ContainerError::NotJpeg);
        }
        let mut segments = Vec::new();
        let mut pos = 2;
        loop {
            if pos >= bytes.len() {
                return Ok(Self {
                    segments,
                    tail: Vec::new(),
                });
            }
            if bytes[pos] != 0xFF {
                return Err(ContainerError::Corrupt("JPEG marker"));
            }
            let marker_start = pos;
            while pos < bytes.len() && bytes[pos] == 0xFF {
                pos += 1;
            }
            let Some(&marker) = bytes.get(pos) else {
                return Err(ContainerError::Corrupt("JPEG marker"));
            };
            pos += 1;

            if marker == MARKER_SOS || marker == MARKER_EOI {
                return Ok(Self {
                    segments,
                    tail: bytes[marker_start..].to_vec(),
                });
            }
            if marker == 0x01 || (0xD0..=0xD7).contains(&marker) {
                segments.push(Segment {
                    marker,
                    data: Vec::new(),
                    standalone: true,
                });
                continue;
            }

            let Some(len_bytes) = bytes.get(pos..pos + 2) else {
                return Err(ContainerError::Corrupt("JPEG segment length"));
            };
            let len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
            if len < 2 || pos + len > bytes.len() {
                return Err(ContainerError::Corrupt("JPEG segment length"));
            }
            segments.push(Segment {
                marker,
                data: bytes[pos + 2..pos + len].to_vec(),
                standalone: false,
            });
            pos += len;
        }
    }

    fn photoshop_segment(&self) -> Option<&Segment> {
        self.segments
            .iter()
            .find(|seg| seg.marker == MARKER_APP13 && seg.data.starts_with(PHOTOSHOP_SIGNATURE))
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0xFF, 0xD8];
        for seg in &self.segments {
            out.push(0xFF);
            out.push(seg.marker);
            if seg.standalone {
                continue;
            }
            out.extend_from_slice(&((seg.data.len() + 2) as u16).to_be_bytes());
            out.extend_from_slice(&seg.data);
        }
        out.extend_from_slice(&self.tail);
        out
    }
}

#[derive(Debug, Clone)]
struct ImageResource {
    id: u16,
    name: Vec<u8>,
    data: Vec<u8>,
}

fn parse_resources(data: &[u8]) -> Result<Vec<ImageResource>, ContainerError> {
    let mut out = Vec::new();
    let mut pos = 0;
    while pos + 4 <= data.len() && &data[pos..pos + 4] == RESOURCE_SIGNATURE {
        pos += 4;
        let header = data
            .get(pos..pos + 3)
            .ok_or(ContainerError::Corrupt("image resource header"))?;
        let id = u16::from_be_bytes([header[0], header[1]]);
        let name_len = header[2] as usize;
        pos += 2;
        // Pascal string: length byte plus bytes, padded to an even size.
        let name_field = (1 + name_len + 1) & !1;
        let name = data
            .get(pos + 1..pos + 1 + name_len)
            .ok_or(ContainerError::Corrupt("image resource name"))?
            .to_vec();
        pos += name_field;
        let size_bytes = data
            .get(pos..pos + 4)
            .ok_or(ContainerError::Corrupt("image resource size"))?;
        let size =
            u32::from_be_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]])
                as usize;
        pos += 4;
        let body = data
            .get(pos..pos + size)
            .ok_or(ContainerError::Corrupt("image resource data"))?
            .to_vec();
        pos += size + (size & 1);
        out.push(ImageResource {
            id,
            name,
            data: body,
        });
    }
    Ok(out)
}

fn serialize_resources(resources: &[ImageResource]) -> Vec<u8> {
    let mut out = Vec::new();
    for res in resources {
        out.extend_from_slice(RESOURCE_SIGNATURE);
        out.extend_from_slice(&res.id.to_be_bytes());
        let name_len = res.name.len().min(255);
        out.push(name_len as u8);
        out.extend_from_slice(&res.name[..name_len]);
        if (1 + name_len) % 2 == 1 {
            out.push(0);
        }
        out.extend_from_slice(&(res.data.len() as u32).to_be_bytes());
        out.extend_from_slice(&res.data);
        if res.data.len() % 2 == 1 {
            out.push(0);
        }
    }
    out
}

fn parse_datasets(data: &[u8]) -> Result<Vec<IptcDataset>, ContainerError> {
    let mut out = Vec::new();
    let mut pos = 0;
    // Trailing padding after the last dataset is common and ignored.
    while pos < data.len() && data[pos] == IIM_TAG_MARKER {
        let header = data
            .get(pos + 1..pos + 5)
            .ok_or(ContainerError::Corrupt("IIM dataset header"))?;
        let record = header[0];
        let dataset = header[1];
        let raw_len = u16::from_be_bytes([header[2], header[3]]);
        pos += 5;
        let size = if raw_len & 0x8000 != 0 {
            let count = (raw_len & 0x7FFF) as usize;
            if count == 0 || count > 4 {
                return Err(ContainerError::Corrupt("IIM extended length"));
            }
            let len_bytes = data
                .get(pos..pos + count)
                .ok_or(ContainerError::Corrupt("IIM extended length"))?;
            pos += count;
            len_bytes
                .iter()
                .fold(0usize, |acc, byte| (acc << 8) | *byte as usize)
        } else {
            raw_len as usize
        };
        let value = data
            .get(pos..pos + size)
            .ok_or(ContainerError::Corrupt("IIM dataset value"))?
            .to_vec();
        pos += size;
        out.push(IptcDataset {
            record,
            dataset,
            value,
        });
    }
    Ok(out)
}
