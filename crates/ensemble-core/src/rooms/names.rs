//! Built-in room names

/// A default room: an Italian musical term and what it means, shown in the
/// lobby.
#[derive(Debug, Clone, Copy)]
pub struct RoomDef {
    pub name: &'static str,
    pub meaning: &'static str,
}

/// The 16 default rooms, alphabetically ordered A-P.
pub const DEFAULT_ROOMS: [RoomDef; 16] = [
    RoomDef { name: "Allegro", meaning: "lively, fast" },
    RoomDef { name: "Ballata", meaning: "a dance song" },
    RoomDef { name: "Cantabile", meaning: "in a singing style" },
    RoomDef { name: "Dolce", meaning: "sweetly" },
    RoomDef { name: "Espressivo", meaning: "expressively" },
    RoomDef { name: "Fortepiano", meaning: "loud then soft" },
    RoomDef { name: "Giocoso", meaning: "playfully" },
    RoomDef { name: "Harmonics", meaning: "overtone series" },
    RoomDef { name: "Intermezzo", meaning: "a short connecting piece" },
    RoomDef { name: "Jubiloso", meaning: "jubilantly" },
    RoomDef { name: "Kaprizios", meaning: "capricious, free-spirited" },
    RoomDef { name: "Legato", meaning: "smoothly connected" },
    RoomDef { name: "Maestoso", meaning: "majestically" },
    RoomDef { name: "Notturno", meaning: "a night piece" },
    RoomDef { name: "Ostinato", meaning: "a persistent pattern" },
    RoomDef { name: "Pizzicato", meaning: "plucked strings" },
];
