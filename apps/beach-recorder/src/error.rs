use recorder_sdk::ApiError;
use recorder_sdk::kv_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("already recording")]
    AlreadyRecording,
    #[error("not recording")]
    NotRecording,
    #[error("backend unreachable: {0}")]
    BackendUnreachable(#[from] ApiError),
    #[error("storage unavailable: {0}")]
    StorageUnavailable(#[from] StoreError),
    #[error("clip is missing {0}")]
    MalformedClip(&'static str),
    #[error("no clip found")]
    NoPendingClip,
    #[error("no page selected")]
    NoPageSelected,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl RecorderError {
    /// Stable identifier UI surfaces can branch on.
    pub fn code(&self) -> &'static str {
        match self {
            RecorderError::AlreadyRecording => "already_recording",
            RecorderError::NotRecording => "not_recording",
            RecorderError::BackendUnreachable(_) => "backend_unreachable",
            RecorderError::StorageUnavailable(_) => "storage_unavailable",
            RecorderError::MalformedClip(_) => "malformed_clip",
            RecorderError::NoPendingClip => "no_pending_clip",
            RecorderError::NoPageSelected => "no_page_selected",
            RecorderError::InvalidRequest(_) => "invalid_request",
        }
    }

    /// Text shown to the user. Backend rejections show the backend's own
    /// message rather than the transport detail.
    pub fn user_message(&self) -> String {
        match self {
            RecorderError::BackendUnreachable(ApiError::UnexpectedStatus { status, message }) => {
                format!("request failed ({}): {message}", status.as_u16())
            }
            other => other.to_string(),
        }
    }
}

pub type RecorderResult<T> = Result<T, RecorderError>;
