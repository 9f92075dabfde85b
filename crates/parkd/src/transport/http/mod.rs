//! HTTP transport: routes plus the server loop.

mod routes;
mod server;

pub use routes::{
    AllocateQuery, ErrorResponse, HealthCheckResponse, HeldSlot, ReleaseRequest, ReleaseResponse,
    SlotRef, routes,
};
pub use server::{ServerConfig, serve, serve_on};
