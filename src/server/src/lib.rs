//! Just-in-time container image building and serving.
//!
//! The server speaks the pull side of the Distribution v2 API and
//! synthesizes images on demand: a request for a tag that has never been
//! built resolves a rule, pulls the declared base image, applies the
//! rule's mutations as new layers, and persists everything into a
//! content-addressed cache. Later pulls stream straight from disk.

pub mod flight;
pub mod http;
pub mod image;
pub mod layer;
pub mod links;
pub mod media;
pub mod model;
pub mod pattern;
pub mod push;
pub mod rule;
pub mod rules;
pub mod store;
pub mod upstream;
pub mod watch;
