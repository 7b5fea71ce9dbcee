//! DIDL-Lite fragments (spec.md §4.7): the `Result` argument of
//! `ContentDirectory::Browse`/`Search` and the `*MetaData` arguments of
//! `AVTransport::SetAVTransportURI`. Built on the same hand-rolled tree
//! reader as [`crate::device`] rather than a general XML-binding layer,
//! which spec.md §1 marks out of scope.

use crate::error::{Error, Result};
use crate::services::connection_manager::ProtocolInfo;
use crate::xml::{parse_xml_tree, xml_escape, XmlElement};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const XMLNS_DIDL_LITE: &str = "urn:schemas-upnp-org:metadata-1-0/DIDL-Lite/";
const XMLNS_DC: &str = "http://purl.org/dc/elements/1.1/";
const XMLNS_UPNP: &str = "urn:schemas-upnp-org:metadata-1-0/upnp/";

/// The `upnp:class` tag. Only the handful of classes the renderer services
/// care about are named; anything else round-trips as [`ObjectClass::Other`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectClass {
    MusicTrack,
    AudioBroadcast,
    AudioItem,
    Container,
    StorageFolder,
    Other(String),
}

impl Default for ObjectClass {
    fn default() -> Self {
        ObjectClass::MusicTrack
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ObjectClass::MusicTrack => "object.item.audioItem.musicTrack",
            ObjectClass::AudioBroadcast => "object.item.audioItem.audioBroadcast",
            ObjectClass::AudioItem => "object.item.audioItem",
            ObjectClass::Container => "object.container",
            ObjectClass::StorageFolder => "object.container.storageFolder",
            ObjectClass::Other(raw) => raw,
        })
    }
}

impl FromStr for ObjectClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "object.item.audioItem.musicTrack" => ObjectClass::MusicTrack,
            "object.item.audioItem.audioBroadcast" => ObjectClass::AudioBroadcast,
            "object.item.audioItem" => ObjectClass::AudioItem,
            "object.container" => ObjectClass::Container,
            "object.container.storageFolder" => ObjectClass::StorageFolder,
            other => ObjectClass::Other(other.to_string()),
        })
    }
}

/// One `<res>` element: the binary resource a `upnp:class` item points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub protocol_info: ProtocolInfo,
    pub duration: Option<Duration>,
    pub uri: String,
}

/// One `<item>` or `<container>` element of a Browse/Search `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub id: String,
    pub parent_id: String,
    pub restricted: bool,
    pub is_container: bool,
    pub class: ObjectClass,
    pub title: String,
    pub creator: Option<String>,
    pub album: Option<String>,
    pub album_art_uri: Option<String>,
    pub resources: Vec<Resource>,
}

impl Item {
    pub fn new(id: impl Into<String>, parent_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            parent_id: parent_id.into(),
            restricted: true,
            is_container: false,
            class: ObjectClass::MusicTrack,
            title: title.into(),
            creator: None,
            album: None,
            album_art_uri: None,
            resources: Vec::new(),
        }
    }
}

/// Renders a duration as `H:MM:SS` (the `res@duration` grammar).
pub fn duration_to_hms(d: Duration) -> String {
    use std::fmt::Write;
    let mut remaining = d.as_secs();
    let hours = remaining / 3600;
    remaining %= 3600;
    let minutes = remaining / 60;
    let seconds = remaining % 60;

    let mut out = String::new();
    write!(&mut out, "{hours}:{minutes:02}:{seconds:02}").ok();
    out
}

/// Parses the `res@duration` grammar back into a [`Duration`]. Malformed or
/// empty input yields [`Duration::ZERO`] rather than an error — duration is
/// advisory metadata, not load-bearing for playback.
pub fn hms_to_duration(hms: &str) -> Duration {
    let mut total = 0u64;
    for field in hms.splitn(3, ':') {
        let Ok(v) = field.trim().parse::<u64>() else {
            return Duration::ZERO;
        };
        total = total * 60 + v;
    }
    Duration::from_secs(total)
}

/// Parses a `<DIDL-Lite>` fragment (the `Result` of `Browse`/`Search`, or a
/// `*MetaData` action argument) into its item/container list.
pub fn parse_didl_lite(xml: &str) -> Result<Vec<Item>> {
    let root = parse_xml_tree(xml)?;
    if root.local_name() != "DIDL-Lite" {
        return Err(Error::XmlDecode(format!("expected <DIDL-Lite>, got <{}>", root.local_name())));
    }
    let mut items = Vec::new();
    for child in &root.children {
        match child.local_name() {
            "item" => items.push(parse_object(child, false)?),
            "container" => items.push(parse_object(child, true)?),
            _ => {}
        }
    }
    Ok(items)
}

fn parse_object(elem: &XmlElement, is_container: bool) -> Result<Item> {
    let id = elem
        .attr("id")
        .ok_or_else(|| Error::XmlDecode("missing id attribute".into()))?
        .to_string();
    let parent_id = elem
        .attr("parentID")
        .ok_or_else(|| Error::XmlDecode("missing parentID attribute".into()))?
        .to_string();
    let restricted = elem.attr("restricted").map(|v| v == "1" || v == "true").unwrap_or(false);

    let class = elem
        .child_text("class")
        .map(ObjectClass::from_str)
        .transpose()?
        .unwrap_or(ObjectClass::MusicTrack);
    let title = elem.child_text("title").unwrap_or_default().to_string();
    let creator = elem.child_text("creator").map(str::to_string);
    let album = elem.child_text("album").map(str::to_string);
    let album_art_uri = elem.child_text("albumArtURI").map(str::to_string);

    let resources = elem
        .find_all("res")
        .map(|res| {
            let protocol_info = res
                .attr("protocolInfo")
                .ok_or_else(|| Error::XmlDecode("missing res@protocolInfo".into()))?
                .parse()?;
            let duration = res.attr("duration").map(hms_to_duration).filter(|d| !d.is_zero());
            Ok(Resource { protocol_info, duration, uri: res.text_trimmed().to_string() })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Item { id, parent_id, restricted, is_container, class, title, creator, album, album_art_uri, resources })
}

/// Builds a `<DIDL-Lite>` fragment from `items`, the inverse of
/// [`parse_didl_lite`].
pub fn build_didl_lite(items: &[Item]) -> String {
    let mut body = String::new();
    for item in items {
        let tag = if item.is_container { "container" } else { "item" };
        body.push_str(&format!(
            "<{tag} id=\"{}\" parentID=\"{}\" restricted=\"{}\">",
            xml_escape(&item.id),
            xml_escape(&item.parent_id),
            if item.restricted { 1 } else { 0 }
        ));
        body.push_str(&format!("<dc:title>{}</dc:title>", xml_escape(&item.title)));
        if let Some(creator) = &item.creator {
            body.push_str(&format!("<dc:creator>{}</dc:creator>", xml_escape(creator)));
        }
        if let Some(album) = &item.album {
            body.push_str(&format!("<upnp:album>{}</upnp:album>", xml_escape(album)));
        }
        if let Some(art) = &item.album_art_uri {
            body.push_str(&format!("<upnp:albumArtURI>{}</upnp:albumArtURI>", xml_escape(art)));
        }
        for res in &item.resources {
            let duration_attr = res.duration.map(|d| format!(" duration=\"{}\"", duration_to_hms(d))).unwrap_or_default();
            body.push_str(&format!(
                "<res protocolInfo=\"{}\"{duration_attr}>{}</res>",
                xml_escape(&res.protocol_info.to_string()),
                xml_escape(&res.uri)
            ));
        }
        body.push_str(&format!("<upnp:class>{}</upnp:class>", xml_escape(&item.class.to_string())));
        body.push_str(&format!("</{tag}>"));
    }
    format!("<DIDL-Lite xmlns=\"{XMLNS_DIDL_LITE}\" xmlns:dc=\"{XMLNS_DC}\" xmlns:upnp=\"{XMLNS_UPNP}\">{body}</DIDL-Lite>")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item() -> Item {
        let mut item = Item::new("1", "0", "Track One");
        item.creator = Some("Artist".into());
        item.album = Some("Album".into());
        item.resources.push(Resource {
            protocol_info: ProtocolInfo::http_get("audio/mpeg"),
            duration: Some(Duration::from_secs(3725)),
            uri: "http://10.0.0.2:1400/track.mp3".into(),
        });
        item
    }

    #[test]
    fn duration_round_trips() {
        let d = Duration::from_secs(3725);
        let hms = duration_to_hms(d);
        assert_eq!(hms, "1:02:05");
        assert_eq!(hms_to_duration(&hms), d);
    }

    #[test]
    fn zero_duration_round_trips() {
        assert_eq!(duration_to_hms(Duration::ZERO), "0:00:00");
        assert_eq!(hms_to_duration("0:00:00"), Duration::ZERO);
    }

    #[test]
    fn builds_and_parses_didl_item() {
        let xml = build_didl_lite(&[sample_item()]);
        assert!(xml.starts_with("<DIDL-Lite "));
        let parsed = parse_didl_lite(&xml).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].title, "Track One");
        assert_eq!(parsed[0].creator.as_deref(), Some("Artist"));
        assert_eq!(parsed[0].resources.len(), 1);
        assert_eq!(parsed[0].resources[0].uri, "http://10.0.0.2:1400/track.mp3");
        assert_eq!(parsed[0].resources[0].duration, Some(Duration::from_secs(3725)));
    }

    #[test]
    fn container_round_trips_as_container() {
        let mut folder = Item::new("10", "0", "Playlists");
        folder.is_container = true;
        folder.class = ObjectClass::StorageFolder;
        let xml = build_didl_lite(&[folder]);
        assert!(xml.contains("<container "));
        let parsed = parse_didl_lite(&xml).unwrap();
        assert!(parsed[0].is_container);
        assert_eq!(parsed[0].class, ObjectClass::StorageFolder);
    }

    #[test]
    fn rejects_non_didl_root() {
        assert!(parse_didl_lite("<not-didl/>").is_err());
    }
}
