//! Static board tables
//!
//! One entry per supported model id. Pin tables give the name a user types
//! and the hardware index the firmware expects (ADC mux for analog pins,
//! port/bit code for digital pins).

use super::BoardFamily;

/// Where a board's digital pins come from
#[derive(Debug)]
pub(crate) enum DigitalPins {
    /// Explicit (name, code) pairs
    Listed(&'static [(&'static str, u8)]),
    /// Kinetis style `PT<port><bit>` pins, code = port index * 32 + bit
    Ports(&'static [(char, &'static [u8])]),
}

/// Where a board's edge-trigger pins come from
#[derive(Debug)]
pub(crate) enum TriggerPins {
    /// Explicit (name, external interrupt number) pairs
    Listed(&'static [(&'static str, u8)]),
    /// Every digital pin on these ports, using its digital code
    DigitalPorts(&'static [char]),
}

/// Catalog entry for one board model
#[derive(Debug)]
pub(crate) struct BoardSpec {
    pub model: u16,
    pub family: BoardFamily,
    pub names: &'static [&'static str],
    pub analogs: &'static [(&'static str, u8)],
    /// (name, mux, amplifier gain)
    pub differentials: &'static [(&'static str, u8, f64)],
    pub digitals: DigitalPins,
    pub triggers: TriggerPins,
    /// Ports whose digital pins can count edges
    pub frequency_ports: &'static [char],
    pub references: &'static [(&'static str, u8)],
}

const UNO_ANALOGS: &[(&str, u8)] = &[
    ("A0", 0),
    ("A1", 1),
    ("A2", 2),
    ("A3", 3),
    ("A4", 4),
    ("A5", 5),
    ("Temperature", 8),
    ("Bandgap", 14),
];

const NANO_ANALOGS: &[(&str, u8)] = &[
    ("A0", 0),
    ("A1", 1),
    ("A2", 2),
    ("A3", 3),
    ("A4", 4),
    ("A5", 5),
    ("A6", 6),
    ("A7", 7),
    ("Temperature", 8),
    ("Bandgap", 14),
];

const UNO_DIGITALS: &[(&str, u8)] = &[
    ("D0", 48),
    ("D1", 49),
    ("D2", 50),
    ("D3", 51),
    ("D4", 52),
    ("D5", 53),
    ("D6", 54),
    ("D7", 55),
    ("D8", 16),
    ("D9", 17),
    ("D10", 18),
    ("D11", 19),
    ("D12", 20),
    ("D13", 21),
    ("A0", 32),
    ("A1", 33),
    ("A2", 34),
    ("A3", 35),
    ("A4", 36),
    ("A5", 37),
];

const UNO_TRIGGERS: &[(&str, u8)] = &[("D2", 0), ("D3", 1)];

const UNO_REFERENCES: &[(&str, u8)] = &[("Power", 1), ("External", 0), ("1.1V", 3)];

const MEGA_ANALOGS: &[(&str, u8)] = &[
    ("A0", 0),
    ("A1", 1),
    ("A2", 2),
    ("A3", 3),
    ("A4", 4),
    ("A5", 5),
    ("A6", 6),
    ("A7", 7),
    ("A8", 32),
    ("A9", 33),
    ("A10", 34),
    ("A11", 35),
    ("A12", 36),
    ("A13", 37),
    ("A14", 38),
    ("A15", 39),
    ("Bandgap", 30),
];

// TODO: list the Mega digitals past D13
const MEGA_DIGITALS: &[(&str, u8)] = &[
    ("D0", 64),
    ("D1", 65),
    ("D2", 68),
    ("D3", 69),
    ("D4", 101),
    ("D5", 67),
    ("D6", 115),
    ("D7", 116),
    ("D8", 117),
    ("D9", 118),
    ("D10", 20),
    ("D11", 21),
    ("D12", 22),
    ("D13", 23),
];

const MEGA_TRIGGERS: &[(&str, u8)] = &[
    ("D2", 4),
    ("D3", 5),
    ("D18", 3),
    ("D19", 2),
    ("D20", 1),
    ("D21", 0),
];

const MEGA_REFERENCES: &[(&str, u8)] = &[
    ("Power", 1),
    ("External", 0),
    ("1.1V", 2),
    ("2.56V", 3),
];

const LEONARDO_ANALOGS: &[(&str, u8)] = &[
    ("A0", 7),
    ("A1", 6),
    ("A2", 5),
    ("A3", 4),
    ("A4", 1),
    ("A5", 0),
    ("A6/D4", 32),
    ("A7/D12", 33),
    ("A8/D6", 34),
    ("A9/D8", 35),
    ("A10/D9", 36),
    ("A11/D10", 37),
    ("Temperature", 39),
    ("Bandgap", 30),
];

const LEONARDO_DIGITALS: &[(&str, u8)] = &[
    ("D0", 50),
    ("D1", 51),
    ("D2", 49),
    ("D3", 48),
    ("D4", 52),
    ("D5", 38),
    ("D6", 55),
    ("D7", 70),
    ("D8", 20),
    ("D9", 21),
    ("D10", 22),
    ("D11", 23),
    ("D12", 54),
    ("D13", 39),
    ("A0", 87),
    ("A1", 86),
    ("A2", 85),
    ("A3", 84),
    ("A4", 81),
    ("A5", 80),
    ("SCK", 17),
    ("MOSI", 18),
    ("MISO", 19),
];

const LEONARDO_TRIGGERS: &[(&str, u8)] = &[
    ("D0", 2),
    ("D1", 3),
    ("D2", 1),
    ("D3", 0),
    ("D7", 6),
];

const LEONARDO_REFERENCES: &[(&str, u8)] = &[("Power", 1), ("External", 0), ("2.56V", 3)];

const KL25Z_ANALOGS: &[(&str, u8)] = &[
    ("PTB0", 8),
    ("PTB1", 9),
    ("PTB2", 12),
    ("PTB3", 13),
    ("PTC0", 14),
    ("PTC1", 15),
    ("PTC2", 11),
    ("PTD1", 69),
    ("PTD5", 70),
    ("PTD6", 71),
    ("PTE20", 0),
    ("PTE21", 4),
    ("PTE22", 3),
    ("PTE23", 7),
    ("PTE29", 68),
    ("PTE30", 23),
    ("Temperature", 26),
    ("Bandgap", 27),
    ("Aref", 29),
];

const KL25Z_DIFFERENTIALS: &[(&str, u8, f64)] = &[("PTE20-PTE21", 32, 1.0), ("PTE22-PTE23", 35, 1.0)];

const KL25Z_PORTS: &[(char, &[u8])] = &[
    ('A', &[1, 2, 4, 5, 12, 13, 14, 15, 16, 17]),
    ('B', &[0, 1, 2, 3, 8, 9, 10, 11]),
    ('C', &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 16, 17]),
    ('D', &[0, 1, 2, 3, 4, 5, 6, 7]),
    ('E', &[0, 1, 2, 3, 4, 5, 20, 21, 22, 23, 30, 31]),
];

const KL25Z_REFERENCES: &[(&str, u8)] = &[("Power", 1), ("External", 0)];

pub(crate) static BOARDS: &[BoardSpec] = &[
    BoardSpec {
        model: 1,
        family: BoardFamily::Avr,
        names: &[
            "Arduino Uno",
            "Arduino Duemilanove",
            "Arduino Diecimila",
            "Arduino Ethernet",
            "Arduino Pro",
            "Arduino LilyPad",
        ],
        analogs: UNO_ANALOGS,
        differentials: &[],
        digitals: DigitalPins::Listed(UNO_DIGITALS),
        triggers: TriggerPins::Listed(UNO_TRIGGERS),
        frequency_ports: &[],
        references: UNO_REFERENCES,
    },
    BoardSpec {
        model: 2,
        family: BoardFamily::Avr,
        names: &[
            "Arduino Mini",
            "Arduino Nano",
            "Arduino Pro Mini",
            "Arduino Fio",
        ],
        analogs: NANO_ANALOGS,
        differentials: &[],
        digitals: DigitalPins::Listed(UNO_DIGITALS),
        triggers: TriggerPins::Listed(UNO_TRIGGERS),
        frequency_ports: &[],
        references: UNO_REFERENCES,
    },
    BoardSpec {
        model: 3,
        family: BoardFamily::Avr,
        names: &["Arduino Mega"],
        analogs: MEGA_ANALOGS,
        differentials: &[],
        digitals: DigitalPins::Listed(MEGA_DIGITALS),
        triggers: TriggerPins::Listed(MEGA_TRIGGERS),
        frequency_ports: &[],
        references: MEGA_REFERENCES,
    },
    BoardSpec {
        model: 4,
        family: BoardFamily::Avr,
        names: &[
            "Arduino Leonardo",
            "Arduino Yun",
            "Arduino Micro",
            "Arduino Robot",
            "Arduino Esplora",
            "Arduino LilyPad USB",
        ],
        analogs: LEONARDO_ANALOGS,
        // the 32u4 differential ADC is unusable
        differentials: &[],
        digitals: DigitalPins::Listed(LEONARDO_DIGITALS),
        triggers: TriggerPins::Listed(LEONARDO_TRIGGERS),
        frequency_ports: &[],
        references: LEONARDO_REFERENCES,
    },
    BoardSpec {
        model: 5,
        family: BoardFamily::Kinetis,
        names: &["FRDM-KL25Z"],
        analogs: KL25Z_ANALOGS,
        differentials: KL25Z_DIFFERENTIALS,
        digitals: DigitalPins::Ports(KL25Z_PORTS),
        triggers: TriggerPins::DigitalPorts(&['A', 'D']),
        frequency_ports: &['A', 'C', 'D'],
        references: KL25Z_REFERENCES,
    },
];

/// Look up a catalog entry by model id
pub(crate) fn find(model: u16) -> Option<&'static BoardSpec> {
    BOARDS.iter().find(|b| b.model == model)
}
