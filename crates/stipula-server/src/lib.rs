pub mod api;
pub mod config;
mod server;

pub use api::{
    DocumentAccepted, DocumentView, ExtractionPage, ExtractionProvider, ExtractionView,
    ProviderError,
};
pub use config::ServerConfig;
pub use server::{ServerError, build_api_router, serve};
