// 🏠 Listing entity

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RoomType {
    EntireHome,
    PrivateRoom,
    SharedRoom,
    HotelRoom,
}

impl RoomType {
    pub const ALL: [RoomType; 4] = [
        RoomType::EntireHome,
        RoomType::PrivateRoom,
        RoomType::SharedRoom,
        RoomType::HotelRoom,
    ];

    /// Label used by the source feed and stored in the warehouse
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomType::EntireHome => "Entire home/apt",
            RoomType::PrivateRoom => "Private room",
            RoomType::SharedRoom => "Shared room",
            RoomType::HotelRoom => "Hotel room",
        }
    }

    pub fn parse(raw: &str) -> Option<RoomType> {
        let raw = raw.trim();
        RoomType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(raw))
    }
}

/// A cleansed listing row (dim_listings_cleansed)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: i64,
    pub listing_name: String,
    pub room_type: RoomType,
    /// Always >= 1 after cleansing
    pub minimum_nights: i64,
    pub host_id: i64,
    pub price: Decimal,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
