pub mod api_error;
pub mod http_api;
pub mod janitor;
pub mod logging;
