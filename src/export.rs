//! RSS 2.0 rendering of retained items.

use std::io::{Cursor, Write};

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

use crate::config::Config;
use crate::db::{Feed, Item, SourcedItem};

pub const RSS_CONTENT_TYPE: &str = "application/rss+xml; charset=utf-8";

const GENERATOR: &str = "rss-cache";

/// Settings shared by every exported document.
#[derive(Debug, Clone)]
pub struct ExportSettings {
    pub public_url: String,
    pub language: String,
}

impl From<&Config> for ExportSettings {
    fn from(config: &Config) -> Self {
        Self {
            public_url: config.public_url.trim_end_matches('/').to_string(),
            language: config.language.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub title: String,
    pub link: String,
    pub description: String,
    pub language: String,
}

/// Feed an item is attributed to in a merged document.
#[derive(Debug, Clone, Copy)]
pub struct Source<'a> {
    pub name: &'a str,
    pub url: &'a str,
}

#[derive(Debug, Clone, Copy)]
pub struct ExportItem<'a> {
    pub item: &'a Item,
    pub source: Option<Source<'a>>,
}

pub fn feed_document(
    feed: &Feed,
    items: &[Item],
    settings: &ExportSettings,
    built_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let channel = ChannelInfo {
        title: format!("RSS Cache - {}", feed.name),
        link: format!("{}/rss/feed/{}", settings.public_url, feed.id),
        description: format!("Cached feed: {}", feed.name),
        language: settings.language.clone(),
    };
    let items: Vec<_> = items
        .iter()
        .map(|item| ExportItem { item, source: None })
        .collect();
    render_rss(&channel, &items, built_at)
}

pub fn merged_document(
    items: &[SourcedItem],
    settings: &ExportSettings,
    built_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let channel = ChannelInfo {
        title: "RSS Cache - All Feeds".to_string(),
        link: format!("{}/rss/all", settings.public_url),
        description: "Combined feed from all sources".to_string(),
        language: settings.language.clone(),
    };
    let items: Vec<_> = items
        .iter()
        .map(|sourced| ExportItem {
            item: &sourced.item,
            source: Some(Source {
                name: &sourced.feed_name,
                url: &sourced.feed_url,
            }),
        })
        .collect();
    render_rss(&channel, &items, built_at)
}

pub fn render_rss(
    channel: &ChannelInfo,
    items: &[ExportItem<'_>],
    built_at: DateTime<Utc>,
) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut rss = BytesStart::new("rss");
    rss.push_attribute(("version", "2.0"));
    rss.push_attribute(("xmlns:atom", "http://www.w3.org/2005/Atom"));
    rss.push_attribute(("xmlns:dc", "http://purl.org/dc/elements/1.1/"));
    writer.write_event(Event::Start(rss))?;
    writer.write_event(Event::Start(BytesStart::new("channel")))?;

    write_text_element(&mut writer, "title", &channel.title)?;
    write_text_element(&mut writer, "link", &channel.link)?;
    write_text_element(&mut writer, "description", &channel.description)?;
    write_text_element(&mut writer, "language", &channel.language)?;
    write_text_element(&mut writer, "lastBuildDate", &built_at.to_rfc2822())?;
    write_text_element(&mut writer, "generator", GENERATOR)?;

    let mut self_link = BytesStart::new("atom:link");
    self_link.push_attribute(("href", channel.link.as_str()));
    self_link.push_attribute(("rel", "self"));
    self_link.push_attribute(("type", "application/rss+xml"));
    writer.write_event(Event::Empty(self_link))?;

    for entry in items {
        write_item(&mut writer, entry)?;
    }

    writer.write_event(Event::End(BytesEnd::new("channel")))?;
    writer.write_event(Event::End(BytesEnd::new("rss")))?;

    let bytes = writer.into_inner().into_inner();
    Ok(String::from_utf8(bytes)?)
}

fn write_item<W: Write>(writer: &mut Writer<W>, entry: &ExportItem<'_>) -> anyhow::Result<()> {
    let item = entry.item;
    writer.write_event(Event::Start(BytesStart::new("item")))?;

    write_cdata_element(writer, "title", &item.title)?;
    write_text_element(writer, "link", &item.link)?;

    let description = match entry.source {
        Some(source) => format!("[{}] {}", source.name, item.description),
        None => item.description.clone(),
    };
    write_cdata_element(writer, "description", &description)?;

    let mut guid = BytesStart::new("guid");
    guid.push_attribute(("isPermaLink", "false"));
    writer.write_event(Event::Start(guid))?;
    writer.write_event(Event::Text(BytesText::new(&item.guid)))?;
    writer.write_event(Event::End(BytesEnd::new("guid")))?;

    if let Some(effective_at) = item.effective_at() {
        write_text_element(writer, "pubDate", &effective_at.to_rfc2822())?;
    }

    if let Some(author) = item.author.as_deref().filter(|a| !a.is_empty()) {
        write_cdata_element(writer, "dc:creator", author)?;
    }

    if let Some(source) = entry.source {
        let mut element = BytesStart::new("source");
        element.push_attribute(("url", source.url));
        writer.write_event(Event::Start(element))?;
        writer.write_event(Event::Text(BytesText::new(source.name)))?;
        writer.write_event(Event::End(BytesEnd::new("source")))?;
    }

    writer.write_event(Event::End(BytesEnd::new("item")))?;
    Ok(())
}

fn write_text_element<W: Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

/// CDATA cannot contain `]]>`, so such text is split across sections.
fn write_cdata_element<W: Write>(
    writer: &mut Writer<W>,
    name: &str,
    text: &str,
) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;

    let mut parts = text.split("]]>").peekable();
    let mut first = true;
    while let Some(part) = parts.next() {
        let mut section = String::with_capacity(part.len() + 3);
        if !first {
            section.push('>');
        }
        section.push_str(part);
        if parts.peek().is_some() {
            section.push_str("]]");
        }
        if !section.is_empty() {
            writer.write_event(Event::CData(BytesCData::new(section)))?;
        }
        first = false;
    }

    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::format_timestamp;

    fn settings() -> ExportSettings {
        ExportSettings {
            public_url: "http://localhost:5050".to_string(),
            language: "en".to_string(),
        }
    }

    fn built_at() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-15T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn item(id: i64, title: &str, link: &str) -> Item {
        Item {
            id,
            feed_id: 1,
            guid: format!("guid-{}", id),
            title: title.to_string(),
            link: link.to_string(),
            description: format!("Description {}", id),
            author: None,
            published: Some(format_timestamp(built_at())),
            ingested_at: format_timestamp(built_at()),
            hidden: false,
        }
    }

    fn feed() -> Feed {
        Feed {
            id: 7,
            name: "Tech & Science".to_string(),
            url: "https://tech.example.com/rss".to_string(),
            max_items: 30,
            last_fetched: None,
            last_error: None,
            created_at: format_timestamp(built_at()),
        }
    }

    #[test]
    fn test_feed_document_channel() {
        let xml = feed_document(&feed(), &[], &settings(), built_at()).unwrap();

        assert!(xml.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?>"#));
        assert!(xml.contains(r#"<rss version="2.0""#));
        assert!(xml.contains("<title>RSS Cache - Tech &amp; Science</title>"));
        assert!(xml.contains("<link>http://localhost:5050/rss/feed/7</link>"));
        assert!(xml.contains("<language>en</language>"));
        assert!(xml.contains("<lastBuildDate>Sat, 15 Jun 2024 12:00:00 +0000</lastBuildDate>"));
        assert!(xml.contains(r#"rel="self""#));
    }

    #[test]
    fn test_item_elements() {
        let mut entry = item(1, "Hello <World>", "https://example.com/a?x=1&y=2");
        entry.author = Some("Jane".to_string());

        let xml = feed_document(&feed(), &[entry], &settings(), built_at()).unwrap();

        assert!(xml.contains("<![CDATA[Hello <World>]]>"));
        assert!(xml.contains("<link>https://example.com/a?x=1&amp;y=2</link>"));
        assert!(xml.contains(r#"<guid isPermaLink="false">guid-1</guid>"#));
        assert!(xml.contains("<pubDate>Sat, 15 Jun 2024 12:00:00 +0000</pubDate>"));
        assert!(xml.contains("<dc:creator><![CDATA[Jane]]></dc:creator>"));
        assert!(!xml.contains("<source"));
    }

    #[test]
    fn test_cdata_terminator_is_split() {
        let mut entry = item(1, "T", "https://example.com/a");
        entry.description = "before ]]> after".to_string();

        let xml = feed_document(&feed(), &[entry], &settings(), built_at()).unwrap();
        assert!(xml.contains("<![CDATA[before ]]]]><![CDATA[> after]]>"));
    }

    #[test]
    fn test_merged_document_attributes_sources() {
        let items = vec![
            SourcedItem {
                item: item(1, "From A", "https://a.com/1"),
                feed_name: "Feed A".to_string(),
                feed_url: "https://a.com/rss".to_string(),
            },
            SourcedItem {
                item: item(2, "From B", "https://b.com/1"),
                feed_name: "Feed B".to_string(),
                feed_url: "https://b.com/rss".to_string(),
            },
        ];

        let xml = merged_document(&items, &settings(), built_at()).unwrap();

        assert!(xml.contains("<link>http://localhost:5050/rss/all</link>"));
        assert!(xml.contains(r#"<source url="https://a.com/rss">Feed A</source>"#));
        assert!(xml.contains(r#"<source url="https://b.com/rss">Feed B</source>"#));
        assert!(xml.contains("<![CDATA[[Feed A] Description 1]]>"));
    }

    #[test]
    fn test_output_is_a_valid_feed() {
        let items = vec![
            item(1, "One", "https://example.com/1"),
            item(2, "Two", "https://example.com/2"),
        ];

        let xml = feed_document(&feed(), &items, &settings(), built_at()).unwrap();
        let parsed = feed_rs::parser::parse(xml.as_bytes()).unwrap();

        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[1].links[0].href, "https://example.com/2");
    }

    #[test]
    fn test_settings_from_config_trim_trailing_slash() {
        let config = Config {
            public_url: "http://cache.local/".to_string(),
            ..Config::default()
        };
        let settings = ExportSettings::from(&config);
        assert_eq!(settings.public_url, "http://cache.local");
    }
}
