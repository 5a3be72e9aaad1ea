//! # Disassembly Module
//!
//! Human-readable disassembly of function code, used to inspect what the epilog detector sees.
//!
//! The decoding is done by iced-x86 with its NASM formatter. Every instruction keeps the pieces
//! of formatted text together with their kind, so a front end can color them.

use std::fmt::{Display, Write};

use iced_x86::{
    Decoder, DecoderOptions, Formatter, FormatterOutput, FormatterTextKind, Instruction,
    NasmFormatter,
};
use serde::{Serialize, Serializer};
use tracing::warn;

use crate::addr::Addr;

const CODE_BITNESS: u32 = 64;

/// A piece of text and its kind (e.g. mnemonic, register, number)
pub type TextContent = (String, FormatterTextKind);

#[derive(Serialize)]
struct SerializableTextContent {
    text: String,
    kind: String,
}

/// Collects the formatted text pieces produced by the iced-x86 formatter
struct DisassemblyOutput(Vec<TextContent>);

impl DisassemblyOutput {
    fn new() -> Self {
        DisassemblyOutput(Vec::new())
    }
    fn inner(&self) -> &[TextContent] {
        &self.0
    }
    fn clear(&mut self) {
        self.0.clear();
    }
}

impl FormatterOutput for DisassemblyOutput {
    fn write(&mut self, text: &str, kind: FormatterTextKind) {
        self.0.push((text.to_string(), kind));
    }
}

/// One decoded instruction
#[derive(Debug, Clone, Hash, Serialize)]
pub struct DisassembledInstruction {
    pub addr: Addr,
    pub raw: Vec<u8>,
    #[serde(serialize_with = "serialize_text_content")]
    pub content: Vec<TextContent>,
    /// The instruction contains the address the disassembly was requested for
    pub marked: bool,
    /// The decoder did not recognize the bytes
    pub invalid: bool,
}

/// The disassembly of a window of code
///
/// # Examples
///
/// ```
/// use pecoff_unwind::addr::Addr;
/// use pecoff_unwind::disassemble::Disassembly;
///
/// // add rsp, 0x28; pop rbx; ret
/// let code = [0x48, 0x83, 0xc4, 0x28, 0x5b, 0xc3];
/// let mark = Some(Addr::from(0x1004u64));
/// let disassembly = Disassembly::disassemble(&code, Addr::from(0x1000u64), mark);
///
/// assert_eq!(disassembly.instructions().len(), 3);
/// assert!(disassembly.instructions()[1].marked);
/// println!("{disassembly}");
/// ```
#[derive(Debug, Clone, Default, Hash, Serialize)]
pub struct Disassembly {
    instructions: Vec<DisassembledInstruction>,
}

impl Disassembly {
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Disassembles `data` as 64-bit code located at `first_addr`
    ///
    /// # Parameters
    ///
    /// * `data` - The raw code bytes
    /// * `first_addr` - The address of the first byte, usually an RVA
    /// * `mark` - The instruction covering this address is marked
    ///
    /// Undecodable bytes are kept as invalid instructions, so the window is always covered
    /// completely.
    #[must_use]
    pub fn disassemble(data: &[u8], first_addr: Addr, mark: Option<Addr>) -> Self {
        let mut decoder =
            Decoder::with_ip(CODE_BITNESS, data, first_addr.u64(), DecoderOptions::NONE);
        let mut formatter = NasmFormatter::new();

        // padding
        formatter.options_mut().set_first_operand_char_index(16);

        // numbers stuff
        formatter.options_mut().set_hex_suffix("");
        formatter.options_mut().set_hex_prefix("0x");
        formatter.options_mut().set_uppercase_hex(false);
        formatter.options_mut().set_decimal_suffix("");
        formatter.options_mut().set_decimal_prefix("");

        // memory stuff
        formatter.options_mut().set_show_symbol_address(true);
        formatter.options_mut().set_rip_relative_addresses(true);
        formatter
            .options_mut()
            .set_memory_size_options(iced_x86::MemorySizeOptions::Always);

        let mut disassembly = Self::empty();
        let mut instruction = Instruction::default();
        let mut text_contents = DisassemblyOutput::new();
        while decoder.can_decode() {
            let position = decoder.position();
            decoder.decode_out(&mut instruction);
            text_contents.clear();
            formatter.format(&instruction, &mut text_contents);

            let raw = &data[position..position + instruction.len()];
            let addr = Addr::from(instruction.ip());
            let invalid = instruction.is_invalid();
            if invalid {
                warn!("could not decode the instruction at {addr}");
            }

            disassembly.instructions.push(DisassembledInstruction {
                addr,
                raw: raw.to_vec(),
                content: text_contents.inner().to_vec(),
                marked: mark.is_some_and(|m| addr <= m && m.u64() < addr.u64() + raw.len() as u64),
                invalid,
            });
        }

        disassembly
    }

    #[must_use]
    pub fn instructions(&self) -> &[DisassembledInstruction] {
        &self.instructions
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

impl Display for DisassembledInstruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut raw = String::new();
        for byte in &self.raw {
            write!(raw, "{byte:02x} ")?;
        }
        write!(f, "{}", self.addr)?;
        write!(f, "{:<4}", if self.marked { "(*)" } else { "" })?;
        write!(f, "{raw:<30}\t")?;
        for (text, _kind) in &self.content {
            write!(f, "{text}")?;
        }
        Ok(())
    }
}

impl Display for Disassembly {
    /// Will look like this:
    ///
    /// ```text
    /// 0x0000000000001110(*) 48 83 c4 28                      add             rsp,0x28
    /// 0x0000000000001114    5b                              pop             rbx
    /// 0x0000000000001115    c3                              ret
    /// ```
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for instruction in &self.instructions {
            writeln!(f, "{instruction}")?;
        }
        Ok(())
    }
}

impl From<&TextContent> for SerializableTextContent {
    fn from(content: &TextContent) -> Self {
        Self {
            text: content.0.clone(),
            kind: format!("{:?}", content.1),
        }
    }
}

fn serialize_text_content<S>(
    data: &[TextContent],
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let serializable: Vec<SerializableTextContent> =
        data.iter().map(SerializableTextContent::from).collect();
    serializable.serialize(serializer)
}
