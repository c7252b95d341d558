// Entity Models
// Cleansed row types of the warehouse dimensions and fact table.

pub mod host;
pub mod listing;
pub mod review;

pub use host::{parse_superhost, Host, ANONYMOUS_HOST};
pub use listing::{Listing, RoomType};
pub use review::{surrogate_key, Review, Sentiment};
