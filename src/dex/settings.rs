/// Knobs for assembling a dex file
#[derive(Clone, Debug)]
pub struct Settings {
    /// Maximum number of distinct entries in each of the method and field tables
    ///
    /// Dex version 035 addresses these with 16-bit indices, so values above
    /// `Settings::DEX_ID_LIMIT` are clamped. Types and prototypes are only held to that format
    /// ceiling.
    pub max_member_ids: usize,

    /// Size of the register frame available to a single method
    ///
    /// Locals are assigned registers in declaration order and must all fit in this many
    /// registers. The format itself stores the frame size in 16 bits.
    pub max_registers: usize,

    /// How unconditional jumps are encoded
    ///
    /// Since branch offsets are fixed before the instructions around them are known, the form is
    /// chosen up front rather than relaxed afterwards.
    pub goto_form: GotoForm,

    /// Emit `debug_info_item`s mapping code addresses to the lines set with `set_line`
    pub emit_debug_info: bool,
}

impl Settings {
    /// Number of entries addressable with a 16-bit index
    pub const DEX_ID_LIMIT: usize = 0x10000;

    /// Largest frame expressible in a `code_item`
    pub const DEX_REGISTER_LIMIT: usize = 0xFFFF;

    /// Effective limit on the method and field tables
    pub fn id_limit(&self) -> usize {
        self.max_member_ids.min(Self::DEX_ID_LIMIT)
    }

    /// Effective register frame capacity
    pub fn register_limit(&self) -> usize {
        self.max_registers.min(Self::DEX_REGISTER_LIMIT)
    }
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            max_member_ids: Settings::DEX_ID_LIMIT,
            max_registers: Settings::DEX_REGISTER_LIMIT,
            goto_form: GotoForm::Goto16,
            emit_debug_info: true,
        }
    }
}

/// Encoding used for `goto`
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum GotoForm {
    /// `goto +AA` (8-bit signed offset, one code unit)
    Goto,

    /// `goto/16 +AAAA` (16-bit signed offset, two code units)
    Goto16,

    /// `goto/32 +AAAAAAAA` (32-bit signed offset, three code units)
    Goto32,
}
