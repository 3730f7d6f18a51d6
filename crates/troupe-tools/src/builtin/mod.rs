pub mod http_get;
pub mod utc_now;
