pub mod connection;
pub mod gamification;
pub mod locks;
pub mod pipeline;
pub mod registry;
pub mod repository;
pub mod routes;
