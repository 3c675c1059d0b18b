//! HTTP surface. All routes live under `/api`; everything except login
//! requires a bearer token issued by `POST /api/auth/login` and most
//! routes are further gated by role.

pub mod endpoints;
pub mod error;
pub mod middleware;
pub mod router;
pub mod types;
