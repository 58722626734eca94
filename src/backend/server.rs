use async_trait::async_trait;
use reqwest::{header, Client, Response, StatusCode};
use std::time::Duration;

use super::models::{Chapter, ChapterFlags, ChapterKey, Manga, PageBytes};
use crate::config::ServerConfig;
use crate::error::{Error, Result};

const API_PREFIX: &str = "/api/v1";
const PAGE_OFFSET_KEY: &str = "juiPageOffset";
const READER_MODE_KEY: &str = "juiReaderMode";

/// Everything the reader needs from the manga server.
#[async_trait]
pub trait MangaRepository: Send + Sync {
    async fn get_manga(&self, manga_id: i64) -> Result<Manga>;

    async fn get_chapters(&self, manga_id: i64) -> Result<Vec<Chapter>>;

    /// Fetching a single chapter makes the server resolve its page count.
    async fn get_chapter(&self, manga_id: i64, index: u32) -> Result<Chapter>;

    async fn get_chapter_page(&self, chapter: &Chapter, page: usize) -> Result<PageBytes>;

    async fn update_chapter_flags(&self, chapter: &Chapter, flags: ChapterFlags) -> Result<()>;

    async fn update_chapter_meta(&self, chapter: &Chapter, page_offset: i32) -> Result<()>;

    async fn update_manga_meta(&self, manga: &Manga, reader_mode: &str) -> Result<()>;
}

/// REST client for a Tachidesk-compatible server.
#[derive(Debug, Clone)]
pub struct ServerClient {
    client: Client,
    base_url: String,
}

fn build_client(config: &ServerConfig) -> Result<Client> {
    let client = Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;
    Ok(client)
}

fn form_body(fields: &[(&str, String)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
        .collect::<Vec<_>>()
        .join("&")
}

impl ServerClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config)?,
            base_url: config.url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn manga_url(&self, manga_id: i64) -> String {
        format!("{}{}/manga/{}", self.base_url, API_PREFIX, manga_id)
    }

    fn chapter_url(&self, key: ChapterKey) -> String {
        format!("{}/chapter/{}", self.manga_url(key.manga_id), key.index)
    }

    fn page_url(&self, key: ChapterKey, page: usize) -> String {
        format!("{}/page/{}", self.chapter_url(key), page)
    }

    async fn get(&self, url: &str, not_found: impl FnOnce() -> Error) -> Result<Response> {
        log::debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        check_status(response, url, not_found)
    }

    async fn patch_form(&self, url: &str, fields: &[(&str, String)]) -> Result<()> {
        log::debug!("PATCH {}", url);
        let response = self
            .client
            .patch(url)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form_body(fields))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(())
    }
}

fn check_status(response: Response, url: &str, not_found: impl FnOnce() -> Error) -> Result<Response> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(not_found()),
        status => Err(Error::Status {
            status: status.as_u16(),
            url: url.to_string(),
        }),
    }
}

#[async_trait]
impl MangaRepository for ServerClient {
    async fn get_manga(&self, manga_id: i64) -> Result<Manga> {
        let url = format!("{}/?onlineFetch=false", self.manga_url(manga_id));
        let response = self.get(&url, || Error::MangaNotFound(manga_id)).await?;
        Ok(response.json().await?)
    }

    async fn get_chapters(&self, manga_id: i64) -> Result<Vec<Chapter>> {
        let url = format!("{}/chapters?onlineFetch=false", self.manga_url(manga_id));
        let response = self.get(&url, || Error::MangaNotFound(manga_id)).await?;
        let mut chapters: Vec<Chapter> = response.json().await?;
        chapters.sort_by_key(|chapter| chapter.index);
        Ok(chapters)
    }

    async fn get_chapter(&self, manga_id: i64, index: u32) -> Result<Chapter> {
        let key = ChapterKey { manga_id, index };
        let url = self.chapter_url(key);
        let response = self.get(&url, || Error::ChapterNotFound(key)).await?;
        Ok(response.json().await?)
    }

    async fn get_chapter_page(&self, chapter: &Chapter, page: usize) -> Result<PageBytes> {
        let key = chapter.key();
        let url = self.page_url(key, page);
        let response = self.get(&url, || Error::ChapterNotFound(key)).await?;
        let bytes = response.bytes().await?;
        Ok(PageBytes::from(bytes.as_ref()))
    }

    async fn update_chapter_flags(&self, chapter: &Chapter, flags: ChapterFlags) -> Result<()> {
        let mut fields = Vec::new();
        if let Some(read) = flags.read {
            fields.push(("read", read.to_string()));
        }
        if let Some(page) = flags.last_page_read {
            fields.push(("lastPageRead", page.to_string()));
        }
        if fields.is_empty() {
            return Ok(());
        }
        self.patch_form(&self.chapter_url(chapter.key()), &fields).await
    }

    async fn update_chapter_meta(&self, chapter: &Chapter, page_offset: i32) -> Result<()> {
        let url = format!("{}/meta", self.chapter_url(chapter.key()));
        let fields = [
            ("key", PAGE_OFFSET_KEY.to_string()),
            ("value", page_offset.to_string()),
        ];
        self.patch_form(&url, &fields).await
    }

    async fn update_manga_meta(&self, manga: &Manga, reader_mode: &str) -> Result<()> {
        let url = format!("{}/meta", self.manga_url(manga.id));
        let fields = [
            ("key", READER_MODE_KEY.to_string()),
            ("value", reader_mode.to_string()),
        ];
        self.patch_form(&url, &fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> ServerClient {
        ServerClient::new(&ServerConfig {
            url: url.to_string(),
            ..ServerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn urls_follow_api_layout() {
        let server = client("http://localhost:4567/");
        let key = ChapterKey { manga_id: 12, index: 4 };
        assert_eq!(server.base_url(), "http://localhost:4567");
        assert_eq!(server.manga_url(12), "http://localhost:4567/api/v1/manga/12");
        assert_eq!(
            server.page_url(key, 0),
            "http://localhost:4567/api/v1/manga/12/chapter/4/page/0"
        );
    }

    #[test]
    fn form_body_is_url_encoded() {
        let body = form_body(&[
            ("key", READER_MODE_KEY.to_string()),
            ("value", "Long Strip".to_string()),
        ]);
        assert_eq!(body, "key=juiReaderMode&value=Long%20Strip");
    }
}
