pub mod error;
pub mod router;
pub mod routes;
pub mod services;
pub mod state;

pub use router::build_router;
pub use services::Services;
pub use state::AppState;
