//! Sparkle appcast feeds.
//!
//! An appcast is an RSS document with one `<item>` per release. Versions
//! appear either as `sparkle:*` attributes on `<enclosure>` or as child
//! elements of the item; both forms are accepted.

use async_trait::async_trait;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, warn};

use super::UpdateSource;
use crate::download::Downloader;
use crate::error::UpdateError;
use crate::model::{InstalledApplication, SourceKind, UpdateCandidate};
use crate::version;

/// One release entry from an appcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppcastItem {
    pub title: Option<String>,
    pub description: Option<String>,
    pub short_version: Option<String>,
    pub build_version: Option<String>,
    pub url: Option<String>,
    pub release_notes_link: Option<String>,
}

impl AppcastItem {
    /// Display version, falling back to the build version.
    pub fn version(&self) -> Option<&str> {
        self.short_version
            .as_deref()
            .or(self.build_version.as_deref())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Title,
    Description,
    ShortVersion,
    BuildVersion,
    ReleaseNotesLink,
}

impl Field {
    fn from_tag(tag: &[u8]) -> Option<Self> {
        match tag {
            b"title" => Some(Self::Title),
            b"description" => Some(Self::Description),
            b"sparkle:shortVersionString" => Some(Self::ShortVersion),
            b"sparkle:version" => Some(Self::BuildVersion),
            b"sparkle:releaseNotesLink" => Some(Self::ReleaseNotesLink),
            _ => None,
        }
    }
}

impl AppcastItem {
    fn slot(&mut self, field: Field) -> &mut Option<String> {
        match field {
            Field::Title => &mut self.title,
            Field::Description => &mut self.description,
            Field::ShortVersion => &mut self.short_version,
            Field::BuildVersion => &mut self.build_version,
            Field::ReleaseNotesLink => &mut self.release_notes_link,
        }
    }

    fn append(&mut self, open: &mut OpenField, text: &str) {
        let slot = self.slot(open.field).get_or_insert_with(String::new);
        if open.boundary && !slot.is_empty() && !slot.ends_with(char::is_whitespace) {
            slot.push(' ');
        }
        open.boundary = false;
        slot.push_str(text);
    }
}

/// A field being collected, with the depth of markup nested inside it.
#[derive(Debug, Clone, Copy)]
struct OpenField {
    field: Field,
    depth: usize,
    boundary: bool,
}

impl OpenField {
    fn new(field: Field) -> Self {
        Self {
            field,
            depth: 0,
            boundary: false,
        }
    }
}

fn read_enclosure(item: &mut AppcastItem, element: &BytesStart<'_>) -> Result<(), UpdateError> {
    for attr in element.attributes() {
        let attr = attr.map_err(|e| UpdateError::FeedParse(e.to_string()))?;
        let value = attr
            .unescape_value()
            .map_err(|e| UpdateError::FeedParse(e.to_string()))?
            .into_owned();
        match attr.key.as_ref() {
            b"url" => item.url = Some(value),
            b"sparkle:shortVersionString" => item.short_version = Some(value),
            b"sparkle:version" if item.build_version.is_none() => item.build_version = Some(value),
            _ => {}
        }
    }
    Ok(())
}

/// Parse every `<item>` of an appcast.
pub fn parse_appcast(xml: &str) -> Result<Vec<AppcastItem>, UpdateError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut items = Vec::new();
    let mut current: Option<AppcastItem> = None;
    let mut field: Option<OpenField> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if let Some(open) = field.as_mut() {
                    // Markup inside a field (HTML release notes) is text.
                    open.depth += 1;
                    open.boundary = true;
                    continue;
                }
                match e.name().as_ref() {
                    b"item" => current = Some(AppcastItem::default()),
                    b"enclosure" => {
                        if let Some(item) = current.as_mut() {
                            read_enclosure(item, &e)?;
                        }
                    }
                    tag => {
                        if let Some(item) = current.as_mut() {
                            field = Field::from_tag(tag).map(OpenField::new);
                            if let Some(open) = field {
                                *item.slot(open.field) = None;
                            }
                        }
                    }
                }
            }
            Ok(Event::Empty(e)) => {
                if let Some(open) = field.as_mut() {
                    open.boundary = true;
                } else if e.name().as_ref() == b"enclosure" {
                    if let Some(item) = current.as_mut() {
                        read_enclosure(item, &e)?;
                    }
                }
            }
            Ok(Event::Text(text)) => {
                if let (Some(item), Some(open)) = (current.as_mut(), field.as_mut()) {
                    let text = text.unescape().map_err(|e| UpdateError::FeedParse(e.to_string()))?;
                    item.append(open, &text);
                }
            }
            Ok(Event::CData(data)) => {
                if let (Some(item), Some(open)) = (current.as_mut(), field.as_mut()) {
                    item.append(open, &String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Ok(Event::End(e)) => match field.as_mut() {
                Some(open) if open.depth > 0 => {
                    open.depth -= 1;
                    open.boundary = true;
                }
                Some(_) => field = None,
                None => {
                    if e.name().as_ref() == b"item" {
                        items.extend(current.take());
                    }
                }
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(UpdateError::FeedParse(format!(
                    "at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            Ok(_) => {}
        }
    }

    Ok(items)
}

/// The downloadable item with the highest version.
pub fn newest_item(items: &[AppcastItem]) -> Option<&AppcastItem> {
    items
        .iter()
        .filter(|item| item.version().is_some() && item.url.is_some())
        .max_by(|a, b| version::compare(a.version().unwrap_or(""), b.version().unwrap_or("")))
}

/// Build a candidate for `app` from an appcast document.
pub fn candidate_from_appcast(app: &InstalledApplication, xml: &str) -> Option<UpdateCandidate> {
    let items = match parse_appcast(xml) {
        Ok(items) => items,
        Err(e) => {
            warn!(app = %app.identifier, error = %e, "Unparseable appcast");
            return None;
        }
    };

    let item = newest_item(&items)?;
    let available = item.version()?;
    if !version::is_newer(available, &app.version) {
        debug!(app = %app.identifier, installed = %app.version, available, "Appcast has nothing newer");
        return None;
    }

    let url = item.url.clone()?;
    let mut candidate = UpdateCandidate::new(app.clone(), available, url, SourceKind::Sparkle);
    if let Some(description) = item.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
        candidate = candidate.with_changelog(description);
    }
    Some(candidate)
}

/// Appcast client for applications that advertise a feed URL.
#[derive(Debug, Clone)]
pub struct SparkleFeedClient {
    downloader: Downloader,
}

impl SparkleFeedClient {
    pub fn new(downloader: Downloader) -> Self {
        Self { downloader }
    }
}

#[async_trait]
impl UpdateSource for SparkleFeedClient {
    fn kind(&self) -> SourceKind {
        SourceKind::Sparkle
    }

    fn applies_to(&self, app: &InstalledApplication) -> bool {
        app.feed_url.as_deref().is_some_and(|url| !url.is_empty())
    }

    async fn fetch_candidate(&self, app: &InstalledApplication) -> Option<UpdateCandidate> {
        let url = app.feed_url.as_deref()?;
        let body = match self.downloader.fetch(url).await {
            Ok(body) => body,
            Err(e) => {
                debug!(app = %app.identifier, url, error = %e, "Appcast fetch failed");
                return None;
            }
        };
        candidate_from_appcast(app, &String::from_utf8_lossy(&body))
    }
}
