use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
#[error("User Error: {msg}")]
pub struct UserError {
    pub msg: String,
}

impl UserError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

pub trait ToUserError<T> {
    fn user_error(self, msg: impl Into<String>) -> anyhow::Result<T>;
}

// Use this to inject a user facing error message into the error chain
// Our main thread can extract this from an error chain and display it to the user
impl<T, E: std::error::Error + Send + Sync + 'static> ToUserError<T> for Result<T, E> {
    fn user_error(self, msg: impl Into<String>) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::Error::from(e).context(UserError::new(msg)))
    }
}

const DEFAULT_USER_ERROR_MESSAGE: &str = "An unknown error occurred";

pub fn get_user_message(error: &anyhow::Error) -> &str {
    if let Some(user_error) = error.downcast_ref::<UserError>() {
        return &user_error.msg;
    }

    let mut source = error.source();
    while let Some(err) = source {
        if let Some(user_error) = err.downcast_ref::<UserError>() {
            return &user_error.msg;
        }
        source = err.source();
    }

    DEFAULT_USER_ERROR_MESSAGE
}

#[derive(Error, Debug)]
#[error("Rate limited")]
pub struct RateLimitedError {
    pub retry_after: Option<Duration>,
    #[source]
    pub source: reqwest::Error,
}

/// Extracts a Retry-After duration if a RateLimitedError is present in the error chain
pub fn extract_retry_after_from_error(error: &anyhow::Error) -> Option<Duration> {
    if let Some(rl) = error.downcast_ref::<RateLimitedError>() {
        return rl.retry_after;
    }

    let mut source = error.source();
    while let Some(err) = source {
        if let Some(rl) = err.downcast_ref::<RateLimitedError>() {
            return rl.retry_after;
        }
        source = err.source();
    }
    None
}

/// Returns true if the error chain contains a reqwest::Error with HTTP 429.
pub fn is_rate_limited_error(error: &anyhow::Error) -> bool {
    // Our custom rate limit error also counts
    if error.downcast_ref::<RateLimitedError>().is_some() {
        return true;
    }

    if let Some(reqwest_err) = error.downcast_ref::<reqwest::Error>() {
        if reqwest_err.status().is_some_and(|s| s.as_u16() == 429) {
            return true;
        }
    }

    let mut source = error.source();
    while let Some(err) = source {
        if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>() {
            if reqwest_err.status().is_some_and(|s| s.as_u16() == 429) {
                return true;
            }
        }
        source = err.source();
    }
    false
}
