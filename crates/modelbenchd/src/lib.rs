//! modelbench daemon library: the axum front end over `modelbench-core`.

pub mod http;

pub use http::{router, serve, serve_session, AppState};
