// Hard caps on catalog size and request shapes.

pub const MAX_AVAILABILITY_TEMPLATES: usize = 10_000;
pub const MAX_UNAVAILABILITY_TEMPLATES: usize = 10_000;
pub const MAX_SESSION_PRODUCTS: usize = 100_000;

/// Active bookings one trainer may hold on a single date.
pub const MAX_BOOKINGS_PER_DAY: usize = 512;

/// Widest date range a block listing may cover, inclusive.
pub const MAX_QUERY_DAYS: i64 = 93;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_DESCRIPTION_LEN: usize = 2_000;
pub const MAX_RECURRING_WEEKS: u32 = 52;
pub const MAX_GRANT_AMOUNT: i64 = 1_000;
