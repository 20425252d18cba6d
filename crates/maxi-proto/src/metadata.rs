//! ICY metadata parsing.
//!
//! Stream titles arrive as free text, most commonly `"Artist - Title"`.
//! Parsing never fails: the worst case is a degraded display where the whole
//! string is shown as the title.

use crate::protocol::{StationDescriptor, Track};

/// Artist/title pair as split from a raw ICY title.  Either side may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IcyTitle {
    pub artist: String,
    pub title: String,
}

impl IcyTitle {
    pub fn is_empty(&self) -> bool {
        self.artist.is_empty() && self.title.is_empty()
    }
}

/// Pull the `StreamTitle` value out of a raw ICY block such as
/// `StreamTitle='Artist - Song';StreamUrl='';`.
///
/// Input that is not an ICY block is returned trimmed, unchanged otherwise:
/// mpv already strips the block down to the bare title.
pub fn extract_stream_title(raw: &str) -> String {
    const KEY: &str = "StreamTitle='";
    let Some(start) = raw.find(KEY) else {
        return raw.trim().to_string();
    };
    let rest = &raw[start + KEY.len()..];
    let end = rest.find("';").unwrap_or_else(|| rest.trim_end().trim_end_matches('\'').len());
    rest[..end].trim().to_string()
}

/// Split a stream title into artist and title.
///
/// Tries `" - "` first, then a bare `"-"`; each only counts when it yields
/// exactly two parts.  Anything else becomes the title with an empty artist.
pub fn parse_icy(raw: &str) -> IcyTitle {
    split_exactly_two(raw, " - ")
        .or_else(|| split_exactly_two(raw, "-"))
        .unwrap_or_else(|| IcyTitle {
            artist: String::new(),
            title: raw.trim().to_string(),
        })
}

fn split_exactly_two(raw: &str, sep: &str) -> Option<IcyTitle> {
    let mut parts = raw.split(sep);
    let artist = parts.next()?;
    let title = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    Some(IcyTitle {
        artist: artist.trim().to_string(),
        title: title.trim().to_string(),
    })
}

impl Track {
    /// Build the displayed track for a parsed title.  When the stream sends
    /// nothing usable, the station name and short description stand in.
    pub fn resolve(parsed: &IcyTitle, station: &StationDescriptor) -> Self {
        if parsed.is_empty() {
            Track::new(station.name.clone(), station.short_desc.clone())
        } else {
            Track::new(parsed.artist.clone(), parsed.title.clone())
        }
    }
}
