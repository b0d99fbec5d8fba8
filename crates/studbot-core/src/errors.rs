/// Core error type.
///
/// Adapter crates map their specific failures into this type so the core can
/// handle them consistently (user-facing notice vs crash report). Business
/// rejections (admission denied, quota exhausted) are deliberately *not*
/// errors: they come back as `bool`/`Option` control flow.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("store returned unexpected shape for {field}: {detail}")]
    ShapeMismatch { field: String, detail: String },

    #[error("payment gateway error: {0}")]
    Gateway(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("messaging error: {0}")]
    Messaging(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
