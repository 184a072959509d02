//! Canonical script-address derivation.
//!
//! Every output script is reduced to a `ScrAddr`: a one-byte type tag
//! followed by a 20-byte hash. This is the key the history index is built
//! on, so two scripts paying the same destination collapse to one entry
//! regardless of the script template used.

use crate::hash::hash160;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_CHECKMULTISIG: u8 = 0xae;
const OP_1: u8 = 0x51;
const OP_16: u8 = 0x60;

pub const SCRADDR_P2PKH: u8 = 0x00;
pub const SCRADDR_P2SH: u8 = 0x05;
pub const SCRADDR_MULTISIG: u8 = 0xfe;
pub const SCRADDR_NONSTANDARD: u8 = 0xff;

pub const SCRADDR_LEN: usize = 21;

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ScrAddr([u8; SCRADDR_LEN]);

impl ScrAddr {
    pub fn new(type_byte: u8, hash: [u8; 20]) -> Self {
        let mut out = [0u8; SCRADDR_LEN];
        out[0] = type_byte;
        out[1..].copy_from_slice(&hash);
        Self(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != SCRADDR_LEN {
            return None;
        }
        let mut out = [0u8; SCRADDR_LEN];
        out.copy_from_slice(bytes);
        Some(Self(out))
    }

    /// Canonical form of an arbitrary output script.
    pub fn from_script(script: &[u8]) -> Self {
        match classify(script) {
            ScriptClass::P2pkh(hash) => Self::new(SCRADDR_P2PKH, hash),
            ScriptClass::P2pk(hash) => Self::new(SCRADDR_P2PKH, hash),
            ScriptClass::P2sh(hash) => Self::new(SCRADDR_P2SH, hash),
            ScriptClass::Multisig => Self::new(SCRADDR_MULTISIG, hash160(script)),
            ScriptClass::NonStandard => Self::new(SCRADDR_NONSTANDARD, hash160(script)),
        }
    }

    pub fn type_byte(&self) -> u8 {
        self.0[0]
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl AsRef<[u8]> for ScrAddr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

enum ScriptClass {
    P2pkh([u8; 20]),
    P2pk([u8; 20]),
    P2sh([u8; 20]),
    Multisig,
    NonStandard,
}

fn classify(script: &[u8]) -> ScriptClass {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        return ScriptClass::P2pkh(hash);
    }

    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        return ScriptClass::P2sh(hash);
    }

    // Bare pubkey: a single 33- or 65-byte push followed by OP_CHECKSIG.
    if (script.len() == 35 && script[0] == 0x21 || script.len() == 67 && script[0] == 0x41)
        && script[script.len() - 1] == OP_CHECKSIG
    {
        return ScriptClass::P2pk(hash160(&script[1..script.len() - 1]));
    }

    if script.len() >= 3
        && (OP_1..=OP_16).contains(&script[0])
        && script[script.len() - 1] == OP_CHECKMULTISIG
        && (OP_1..=OP_16).contains(&script[script.len() - 2])
    {
        return ScriptClass::Multisig;
    }

    ScriptClass::NonStandard
}

pub fn is_multisig(script: &[u8]) -> bool {
    matches!(classify(script), ScriptClass::Multisig)
}

/// The individual signers of a bare multisig script, each in P2PKH form.
/// Empty for anything that is not a well-formed multisig script.
pub fn multisig_participants(script: &[u8]) -> Vec<ScrAddr> {
    if !is_multisig(script) {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut cursor = 1usize;
    let end = script.len() - 2;
    while cursor < end {
        let push_len = script[cursor] as usize;
        if push_len != 33 && push_len != 65 {
            return Vec::new();
        }
        cursor += 1;
        if cursor + push_len > end {
            return Vec::new();
        }
        out.push(ScrAddr::new(
            SCRADDR_P2PKH,
            hash160(&script[cursor..cursor + push_len]),
        ));
        cursor += push_len;
    }
    out
}
