#![forbid(unsafe_code)]

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
pub type BootstrapError = Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Message(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("acquire error: {0}")]
    Acquire(#[from] tokio::sync::AcquireError),
    #[error("HTTP request error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("SQL error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("broker error: {0}")]
    Lapin(#[from] lapin::Error),
    #[error("cache error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("configuration error: {0}")]
    Config(#[from] ::config::ConfigError),
    #[error("bootstrap plan error: {0}")]
    Plan(#[from] crate::plan::PlanError),
    #[error("duration parse error: {0}")]
    Duration(#[from] humantime::DurationError),
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),
    #[error("{context}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    pub fn new<E>(error: E) -> Self
    where
        Error: From<E>,
    {
        error.into()
    }

    pub fn msg<M>(message: M) -> Self
    where
        M: Into<String>,
    {
        Self::Message(message.into())
    }

    pub fn with_context<M>(context: M, source: Error) -> Self
    where
        M: Into<String>,
    {
        Self::Context {
            context: context.into(),
            source: Box::new(source),
        }
    }
}

pub trait Context<T> {
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> Context<T> for std::result::Result<T, E>
where
    Error: From<E>,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Into<String>,
    {
        self.map_err(|err| Error::with_context(context.into(), err.into()))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|err| Error::with_context(f().into(), err.into()))
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Message(value)
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Message(value.to_string())
    }
}

#[macro_export]
macro_rules! err {
    ($fmt:literal $(, $arg:expr)* $(,)?) => {{
        $crate::error::Error::msg(format!($fmt $(, $arg)*))
    }};
    ($err:expr) => {{
        $crate::error::Error::new($err)
    }};
}

#[macro_export]
macro_rules! bail_err {
    ($($arg:tt)*) => {{
        return Err($crate::err!($($arg)*));
    }};
}

#[macro_export]
macro_rules! ensure_err {
    ($cond:expr $(,)?) => {
        if !$cond {
            return Err($crate::err!(concat!("condition failed: ", stringify!($cond))));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::bail_err!($($arg)+);
        }
    };
}
