pub mod deriv;

pub use deriv::{parse_message, DerivFeed, FeedMessage};
