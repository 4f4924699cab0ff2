//! Route-stage plugins: each one transforms a single in-construction route.

pub mod annotations;
mod matcher;
mod redirect;
mod rewrite;
mod reverseproxy;

pub use matcher::MatcherPlugin;
pub use redirect::RedirectPlugin;
pub use rewrite::RewritePlugin;
pub use reverseproxy::ReverseProxyPlugin;
