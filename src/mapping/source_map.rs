/// One known controller/zone pair and the zone number shown on the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceMapping {
    pub controller_key: &'static str,
    pub zone_key: &'static str,
    pub display_zone: u32,
}

const fn entry(controller_key: &'static str, zone_key: &'static str, display_zone: u32) -> SourceMapping {
    SourceMapping {
        controller_key,
        zone_key,
        display_zone,
    }
}

/// Full controller topology in processing order. Position decides the display slot.
pub const SOURCE_MAP: [SourceMapping; 31] = [
    entry("0", "0", 0),
    entry("1", "1", 1),
    entry("1", "2", 2),
    entry("1", "3", 3),
    entry("1", "4", 4),
    entry("1", "5", 5),
    entry("1", "6", 6),
    entry("1", "7", 7),
    entry("1", "8", 8),
    entry("1", "9", 9),
    entry("1", "10", 10),
    entry("1", "11", 11),
    entry("1", "12", 12),
    entry("1", "13", 13),
    entry("1", "14", 14),
    entry("1", "15", 15),
    entry("1", "16", 16),
    entry("2", "1", 1),
    entry("2", "2", 2),
    entry("2", "3", 3),
    entry("2", "4", 4),
    entry("2", "5", 5),
    entry("2", "6", 6),
    entry("2", "7", 7),
    entry("2", "8", 8),
    entry("2", "9", 9),
    entry("2", "10", 10),
    entry("2", "11", 11),
    entry("2", "12", 12),
    entry("2", "13", 13),
    entry("3", "1", 1),
];
