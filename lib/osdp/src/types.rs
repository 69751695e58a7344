//! Public data types exchanged between the protocol engine and the
//! application: commands, events, peripheral identity and capabilities.

/// Maximum number of characters carried by a TEXT command.
pub const TEXT_MAX_LEN: usize = 32;
/// Maximum card data size (bytes) carried by a single card-read event.
pub const CARD_DATA_MAX_LEN: usize = 64;
/// Maximum number of keys carried by a single keypress event.
pub const KEYPRESS_MAX_LEN: usize = 16;

/// Control-panel originated command, dispatched to a peripheral device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Output(OutputCommand),
    Led(LedCommand),
    Buzzer(BuzzerCommand),
    Text(TextCommand),
    ComSet(ComSetCommand),
    KeySet(KeySetCommand),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OutputCommand {
    pub output_no: u8,
    pub control_code: u8,
    pub timer_count: u16,
}

/// One half (temporary or permanent) of an LED command. `timer_count` is
/// only carried on the wire for the temporary half.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LedParams {
    pub control_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub on_color: u8,
    pub off_color: u8,
    pub timer_count: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LedCommand {
    pub reader: u8,
    pub led_number: u8,
    pub temporary: LedParams,
    pub permanent: LedParams,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BuzzerCommand {
    pub reader: u8,
    pub control_code: u8,
    pub on_count: u8,
    pub off_count: u8,
    pub rep_count: u8,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TextCommand {
    pub reader: u8,
    pub control_code: u8,
    pub temp_time: u8,
    pub offset_row: u8,
    pub offset_col: u8,
    pub length: u8,
    pub data: [u8; TEXT_MAX_LEN],
}

impl TextCommand {
    /// Builds a TEXT command from a byte string; at most `TEXT_MAX_LEN`
    /// bytes are retained.
    pub fn new(reader: u8, control_code: u8, temp_time: u8, row: u8, col: u8, text: &[u8]) -> TextCommand {
        let mut data = [0u8; TEXT_MAX_LEN];
        let length = text.len().min(TEXT_MAX_LEN);
        data[..length].copy_from_slice(&text[..length]);

        TextCommand {
            reader,
            control_code,
            temp_time,
            offset_row: row,
            offset_col: col,
            length: length as u8,
            data,
        }
    }

    /// The displayed characters.
    #[inline]
    pub fn text(&self) -> &[u8] {
        &self.data[..self.length as usize]
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ComSetCommand {
    pub address: u8,
    pub baud_rate: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeySetCommand {
    pub key: [u8; 16],
}

/// Unsolicited event surfaced by a peripheral device in a POLL reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    CardRead(CardReadEvent),
    KeyPress(KeyPressEvent),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardFormat {
    RawUnspecified = 0,
    RawWiegand = 1,
    Ascii = 2,
}

impl CardFormat {
    #[inline]
    pub fn from_u8(value: u8) -> Option<CardFormat> {
        match value {
            0 => Some(CardFormat::RawUnspecified),
            1 => Some(CardFormat::RawWiegand),
            2 => Some(CardFormat::Ascii),
            _ => None,
        }
    }
}

/// Card-read event. `length` counts bits for the raw formats and characters
/// for the ASCII format.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CardReadEvent {
    pub reader: u8,
    pub format: CardFormat,
    pub direction: u8,
    pub length: u16,
    pub data: [u8; CARD_DATA_MAX_LEN],
}

impl CardReadEvent {
    /// The number of data bytes occupied on the wire.
    #[inline]
    pub fn byte_len(&self) -> usize {
        match self.format {
            CardFormat::Ascii => self.length as usize,
            _ => (self.length as usize + 7) / 8,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KeyPressEvent {
    pub reader: u8,
    pub length: u8,
    pub data: [u8; KEYPRESS_MAX_LEN],
}

/// Peripheral identity reported in the PDID reply.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct PdId {
    /// 24-bit vendor code.
    pub vendor_code: u32,
    pub model: u8,
    pub version: u8,
    pub serial_number: u32,
    /// 24-bit firmware version; encoded most-significant byte first on the
    /// wire, unlike every other multi-byte field.
    pub firmware_version: u32,
}

/// Capability function codes. The numeric values are wire values and index
/// the per-device capability table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CapFunction {
    ContactStatusMonitoring = 1,
    OutputControl = 2,
    CardDataFormat = 3,
    ReaderLedControl = 4,
    ReaderAudibleOutput = 5,
    ReaderTextOutput = 6,
    TimeKeeping = 7,
    CheckCharacterSupport = 8,
    CommunicationSecurity = 9,
    ReceiveBufferSize = 10,
    LargestCombinedMessageSize = 11,
    SmartCardSupport = 12,
    Readers = 13,
    Biometrics = 14,
}

/// One-past-the-last capability function code; bounds the capability table.
pub const CAP_SENTINEL: usize = 15;

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Capability {
    pub function_code: u8,
    pub compliance_level: u8,
    pub num_items: u8,
}

impl Capability {
    #[inline]
    pub fn new(function: CapFunction, compliance_level: u8, num_items: u8) -> Capability {
        Capability {
            function_code: function as u8,
            compliance_level,
            num_items,
        }
    }
}

/// NAK reason codes reported by a peripheral device.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum NakCode {
    None = 0,
    MsgCheck = 1,
    CmdLen = 2,
    CmdUnknown = 3,
    SeqNum = 4,
    ScUnsupported = 5,
    ScConditions = 6,
    BioType = 7,
    Record = 8,
}

impl NakCode {
    #[inline]
    pub fn from_u8(value: u8) -> NakCode {
        match value {
            1 => NakCode::MsgCheck,
            2 => NakCode::CmdLen,
            3 => NakCode::CmdUnknown,
            4 => NakCode::SeqNum,
            5 => NakCode::ScUnsupported,
            6 => NakCode::ScConditions,
            7 => NakCode::BioType,
            8 => NakCode::Record,
            _ => NakCode::None,
        }
    }
}
