use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::info;

use crate::{
    clients::FeedClient, config::FeedSpec, pipeline::RunContext, store::models::Episode,
    util::title::parse_title,
};

#[async_trait]
pub trait IngestStage: Send + Sync {
    async fn ingest(&self, ctx: &RunContext) -> anyhow::Result<Vec<Episode>>;
}

/// RSSフィードを取得し、エピソードカタログへ変換するステージ。
pub(crate) struct FeedIngestStage {
    client: Arc<FeedClient>,
    feeds: Vec<FeedSpec>,
}

impl FeedIngestStage {
    pub(crate) fn new(client: Arc<FeedClient>, feeds: Vec<FeedSpec>) -> Self {
        Self { client, feeds }
    }
}

#[async_trait]
impl IngestStage for FeedIngestStage {
    async fn ingest(&self, ctx: &RunContext) -> Result<Vec<Episode>> {
        let Some(feed) = self.feeds.iter().find(|feed| feed.name == ctx.podcast) else {
            bail!(
                "unknown podcast {:?}: not present in the feed registry",
                ctx.podcast
            );
        };

        let xml = self
            .client
            .fetch(&feed.url)
            .await
            .with_context(|| format!("failed to fetch feed for podcast {:?}", ctx.podcast))?;

        let episodes = parse_feed(&xml)
            .with_context(|| format!("failed to parse feed for podcast {:?}", ctx.podcast))?;

        info!(
            run_id = %ctx.run_id,
            podcast = %ctx.podcast,
            episodes = episodes.len(),
            "ingested feed"
        );
        Ok(episodes)
    }
}

/// 1エピソード分の解析途中の状態。
#[derive(Debug, Default)]
struct ItemDraft {
    title: String,
    description: String,
    guid: String,
    pub_date: String,
    enclosure_audio: Option<String>,
    media_audio: Option<String>,
    itunes_image: Option<String>,
    media_thumbnail: Option<String>,
    duration: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TextField {
    Title,
    Description,
    Guid,
    PubDate,
    Duration,
    ChannelImageUrl,
}

/// RSS XMLをエピソードの一覧にパースする。
///
/// `<item>` 外の `<itunes:image>` と `<image><url>` はチャンネル単位の
/// フォールバック画像として全エピソードに適用する。整形不能なXMLは
/// エラーとして呼び出し側に返す。
///
/// # Errors
/// XMLの構文エラー、または属性値の復元に失敗した場合はエラーを返す。
pub(crate) fn parse_feed(xml: &str) -> Result<Vec<Episode>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut drafts: Vec<ItemDraft> = Vec::new();
    let mut item: Option<ItemDraft> = None;
    let mut field: Option<TextField> = None;
    let mut buf = String::new();
    let mut in_channel_image = false;
    let mut channel_itunes_image: Option<String> = None;
    let mut channel_image_url: Option<String> = None;

    loop {
        match reader.read_event().context("malformed feed XML")? {
            Event::Start(start) => match start.name().as_ref() {
                b"item" => item = Some(ItemDraft::default()),
                b"image" if item.is_none() => in_channel_image = true,
                b"url" if in_channel_image => field = Some(TextField::ChannelImageUrl),
                b"title" if item.is_some() => field = Some(TextField::Title),
                b"description" if item.is_some() => field = Some(TextField::Description),
                b"guid" if item.is_some() => field = Some(TextField::Guid),
                b"pubDate" if item.is_some() => field = Some(TextField::PubDate),
                b"itunes:duration" if item.is_some() => field = Some(TextField::Duration),
                _ => collect_media_element(&start, item.as_mut(), &mut channel_itunes_image)?,
            },
            Event::Empty(empty) => {
                collect_media_element(&empty, item.as_mut(), &mut channel_itunes_image)?;
            }
            Event::Text(text) => {
                if field.is_some() {
                    buf.push_str(&text.unescape().context("malformed feed text")?);
                }
            }
            Event::CData(cdata) => {
                if field.is_some() {
                    buf.push_str(&String::from_utf8_lossy(&cdata));
                }
            }
            Event::End(end) => {
                match end.name().as_ref() {
                    b"item" => {
                        if let Some(draft) = item.take() {
                            drafts.push(draft);
                        }
                    }
                    b"image" if item.is_none() => in_channel_image = false,
                    _ => {}
                }
                if let Some(target) = field.take() {
                    let value = buf.trim().to_string();
                    buf.clear();
                    store_text(target, value, item.as_mut(), &mut channel_image_url);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(drafts
        .into_iter()
        .map(|draft| {
            finalize_item(
                draft,
                channel_itunes_image.as_deref(),
                channel_image_url.as_deref(),
            )
        })
        .collect())
}

fn store_text(
    target: TextField,
    value: String,
    item: Option<&mut ItemDraft>,
    channel_image_url: &mut Option<String>,
) {
    match (target, item) {
        (TextField::Title, Some(draft)) => draft.title = value,
        (TextField::Description, Some(draft)) => draft.description = value,
        (TextField::Guid, Some(draft)) => draft.guid = value,
        (TextField::PubDate, Some(draft)) => draft.pub_date = value,
        (TextField::Duration, Some(draft)) => {
            if !value.is_empty() {
                draft.duration = Some(value);
            }
        }
        (TextField::ChannelImageUrl, _) => {
            if !value.is_empty() && channel_image_url.is_none() {
                *channel_image_url = Some(value);
            }
        }
        _ => {}
    }
}

/// 属性に情報を持つメディア要素を回収する。
///
/// `<enclosure>` と `<media:content>` は `audio/*` のみ採用し、各候補は
/// 最初に現れた値を保持する。
fn collect_media_element(
    element: &BytesStart<'_>,
    item: Option<&mut ItemDraft>,
    channel_itunes_image: &mut Option<String>,
) -> Result<()> {
    match element.name().as_ref() {
        b"enclosure" => {
            if let Some(draft) = item {
                let (url, mime) = url_and_type(element)?;
                if draft.enclosure_audio.is_none() && is_audio(mime.as_deref()) {
                    draft.enclosure_audio = url;
                }
            }
        }
        b"media:content" => {
            if let Some(draft) = item {
                let (url, mime) = url_and_type(element)?;
                if draft.media_audio.is_none() && is_audio(mime.as_deref()) {
                    draft.media_audio = url;
                }
            }
        }
        b"itunes:image" => {
            let href = attribute_value(element, b"href")?;
            match item {
                Some(draft) => {
                    if draft.itunes_image.is_none() {
                        draft.itunes_image = href;
                    }
                }
                None => {
                    if channel_itunes_image.is_none() {
                        *channel_itunes_image = href;
                    }
                }
            }
        }
        b"media:thumbnail" => {
            if let Some(draft) = item {
                if draft.media_thumbnail.is_none() {
                    draft.media_thumbnail = attribute_value(element, b"url")?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn attribute_value(element: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attribute in element.attributes() {
        let attribute = attribute.context("malformed feed attribute")?;
        if attribute.key.as_ref() == key {
            let value = attribute
                .unescape_value()
                .context("malformed feed attribute value")?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn url_and_type(element: &BytesStart<'_>) -> Result<(Option<String>, Option<String>)> {
    let url = attribute_value(element, b"url")?;
    let mime = attribute_value(element, b"type")?;
    Ok((url, mime))
}

fn is_audio(mime: Option<&str>) -> bool {
    mime.is_some_and(|mime| mime.starts_with("audio/"))
}

fn finalize_item(
    draft: ItemDraft,
    channel_itunes_image: Option<&str>,
    channel_image_url: Option<&str>,
) -> Episode {
    let (episode_num, movie_title) = parse_title(&draft.title);
    let text_for_embedding = format!("{movie_title} {}", draft.description)
        .trim()
        .to_string();
    let audio_url = draft.enclosure_audio.or(draft.media_audio);
    let image_url = draft
        .itunes_image
        .or(draft.media_thumbnail)
        .or_else(|| channel_itunes_image.map(ToString::to_string))
        .or_else(|| channel_image_url.map(ToString::to_string));
    let duration = draft.duration.as_deref().and_then(normalize_duration);

    Episode {
        episode_num,
        title: draft.title,
        movie_title,
        description: draft.description,
        guid: draft.guid,
        pub_date: draft.pub_date,
        audio_url,
        image_url,
        duration,
        text_for_embedding,
    }
}

/// `itunes:duration` を `HH:MM:SS` 表記へ正規化する。
///
/// コロン区切りの値はそのまま通し、秒数表記は時分秒へ変換する。どちらでも
/// ない値は欠損として扱う。
fn normalize_duration(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() {
        return None;
    }
    if value.contains(':') {
        return Some(value.to_string());
    }
    let total = value.parse::<u64>().ok()?;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    Some(format!("{hours:02}:{minutes:02}:{seconds:02}"))
}
