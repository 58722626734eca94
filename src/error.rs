use thiserror::Error;

use crate::backend::models::ChapterKey;

#[derive(Debug, Error)]
pub enum Error {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("manga {0} not found")]
    MangaNotFound(i64),

    #[error("chapter {0} not found")]
    ChapterNotFound(ChapterKey),

    #[error("chapter {0} has no pages")]
    NoPages(ChapterKey),

    #[error("page {page} of chapter {chapter} is not an image")]
    NotAnImage { chapter: ChapterKey, page: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
