use thiserror::Error;

/// Failure taxonomy for the chat core. Read-path failures are surfaced as
/// dismissible notifications; write-path failures must always reach the user.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("no authenticated user")]
    Identity,

    #[error("no active chat")]
    NoActiveChat,

    #[error("network unavailable")]
    Offline,

    #[error("request timed out")]
    Timeout,

    #[error("server returned status {0}")]
    HttpStatus(u16),

    #[error("stored state was corrupt")]
    StorageCorruption,

    #[error("{0}")]
    Api(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl ChatError {
    pub fn from_status(status: u16) -> Self {
        Self::HttpStatus(status)
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Offline
        } else if let Some(status) = err.status() {
            Self::HttpStatus(status.as_u16())
        } else {
            Self::Api(err.to_string())
        }
    }

    /// Localized, user-facing text for toasts and inline banners.
    pub fn user_message(&self) -> String {
        match self {
            Self::Identity => "برای شروع گفتگو ابتدا وارد حساب کاربری شوید".to_string(),
            Self::NoActiveChat => "گفتگوی فعالی وجود ندارد".to_string(),
            Self::Offline => "اتصال اینترنت برقرار نیست. لطفا اتصال خود را بررسی کنید".to_string(),
            Self::Timeout => "پاسخگویی بیش از حد طول کشید. لطفا دوباره تلاش کنید".to_string(),
            Self::HttpStatus(400) => "درخواست نامعتبر بود".to_string(),
            Self::HttpStatus(401) => "دسترسی شما منقضی شده است. دوباره وارد شوید".to_string(),
            Self::HttpStatus(403) => "اجازه دسترسی به این بخش را ندارید".to_string(),
            Self::HttpStatus(404) => "موردی یافت نشد".to_string(),
            Self::HttpStatus(429) => "تعداد درخواست‌ها زیاد است. کمی صبر کنید".to_string(),
            Self::HttpStatus(500) => "خطای داخلی سرور. لطفا بعدا تلاش کنید".to_string(),
            // Server-provided error strings pass through verbatim.
            Self::Api(message) => message.clone(),
            _ => "مشکلی پیش آمد. لطفا دوباره تلاش کنید".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_statuses_have_distinct_messages() {
        let codes = [400u16, 401, 403, 404, 429, 500];
        let messages: Vec<String> = codes
            .iter()
            .map(|c| ChatError::HttpStatus(*c).user_message())
            .collect();
        for (i, a) in messages.iter().enumerate() {
            for b in messages.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        // Unmapped codes fall back to the generic retry prompt.
        assert_eq!(
            ChatError::HttpStatus(502).user_message(),
            ChatError::HttpStatus(418).user_message()
        );
    }

    #[test]
    fn api_errors_surface_verbatim() {
        let err = ChatError::Api("chat already closed".into());
        assert_eq!(err.user_message(), "chat already closed");
    }
}
