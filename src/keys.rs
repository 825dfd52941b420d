//! Keyboard lock-modifier resolution.
//!
//! The server's modifier mapping only says which keycodes sit on which of
//! the eight modifier bits; which bit actually carries NumLock, CapsLock,
//! ShiftLock or ModeSwitch depends on the keysyms bound to those keycodes.
//! The resolver crosses both tables so that keyboard event state can be
//! stripped of lock bits before plugins match bindings. Both tables are
//! refreshed on `MappingNotify`.

use x11rb::protocol::xproto::{GetKeyboardMappingReply, KeyButMask, Keycode, Keysym};
use xkbcommon::xkb::keysyms::{KEY_Caps_Lock, KEY_Mode_switch, KEY_Num_Lock, KEY_Shift_Lock};

/// The modifier bits carrying the lock modifiers, zero when unbound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockMasks {
    pub numlock: u16,
    pub shiftlock: u16,
    pub capslock: u16,
    pub modeswitch: u16,
}

impl LockMasks {
    /// Removes every lock bit from a keyboard event state.
    pub fn strip(&self, state: u16) -> u16 {
        state & !(self.numlock | self.shiftlock | self.capslock | self.modeswitch)
    }
}

/// The keycode-to-keysym table of the server.
#[derive(Debug, Clone)]
pub struct KeysymTable {
    first_keycode: Keycode,
    keysyms_per_keycode: u8,
    keysyms: Vec<Keysym>,
}

impl KeysymTable {
    pub fn new(first_keycode: Keycode, keysyms_per_keycode: u8, keysyms: Vec<Keysym>) -> Self {
        KeysymTable {
            first_keycode,
            keysyms_per_keycode,
            keysyms,
        }
    }

    pub fn from_reply(first_keycode: Keycode, reply: GetKeyboardMappingReply) -> Self {
        Self::new(first_keycode, reply.keysyms_per_keycode, reply.keysyms)
    }

    /// The keysym in column `column` of `keycode`, `None` when out of range
    /// or `NoSymbol`.
    pub fn keysym(&self, keycode: Keycode, column: usize) -> Option<Keysym> {
        if keycode < self.first_keycode || column >= usize::from(self.keysyms_per_keycode) {
            return None;
        }
        let row = usize::from(keycode - self.first_keycode);
        let keysym = *self
            .keysyms
            .get(row * usize::from(self.keysyms_per_keycode) + column)?;
        (keysym != 0).then_some(keysym)
    }

    fn is_bound_to(&self, keycode: Keycode, wanted: Keysym) -> bool {
        (0..usize::from(self.keysyms_per_keycode)).any(|column| self.keysym(keycode, column) == Some(wanted))
    }

    /// Resolves a keyboard event to a keysym, honouring Shift and the
    /// resolved ModeSwitch bit.
    pub fn lookup(&self, keycode: Keycode, state: u16, masks: &LockMasks) -> Option<Keysym> {
        let shifted = state & u16::from(KeyButMask::SHIFT) != 0;
        let mode_switch = masks.modeswitch != 0 && state & masks.modeswitch != 0;
        let column = if mode_switch { 2 } else { 0 } + usize::from(shifted);
        self.keysym(keycode, column)
            .or_else(|| self.keysym(keycode, column & !1))
    }
}

/// Identifies which of the eight modifier bits carry the lock modifiers.
///
/// `modifier_keycodes` is the raw `GetModifierMapping` table: eight groups
/// of `keycodes_per_modifier` keycodes, one group per modifier bit from
/// Shift to Mod5.
pub fn resolve_lock_masks(modifier_keycodes: &[Keycode], keysyms: &KeysymTable) -> LockMasks {
    let mut masks = LockMasks::default();
    let per_modifier = modifier_keycodes.len() / 8;

    for modifier in 0..8usize {
        let bit = 1u16 << modifier;
        for &keycode in &modifier_keycodes[modifier * per_modifier..(modifier + 1) * per_modifier] {
            if keycode == 0 {
                continue;
            }
            if keysyms.is_bound_to(keycode, u32::from(KEY_Num_Lock)) {
                masks.numlock |= bit;
            }
            if keysyms.is_bound_to(keycode, u32::from(KEY_Shift_Lock)) {
                masks.shiftlock |= bit;
            }
            if keysyms.is_bound_to(keycode, u32::from(KEY_Caps_Lock)) {
                masks.capslock |= bit;
            }
            if keysyms.is_bound_to(keycode, u32::from(KEY_Mode_switch)) {
                masks.modeswitch |= bit;
            }
        }
    }

    masks
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEYCODE_A: Keycode = 38;
    const KEYCODE_CAPS: Keycode = 66;
    const KEYCODE_NUM: Keycode = 77;
    const KEYCODE_MODE: Keycode = 92;

    // Two keysym columns per keycode, keycodes 8..=100.
    fn table() -> KeysymTable {
        let first: Keycode = 8;
        let per_keycode = 2u8;
        let mut keysyms = vec![0u32; (101 - usize::from(first)) * usize::from(per_keycode)];
        let mut bind = |keycode: Keycode, column: usize, keysym: Keysym| {
            keysyms[usize::from(keycode - first) * usize::from(per_keycode) + column] = keysym;
        };
        bind(KEYCODE_A, 0, 0x61); // 'a'
        bind(KEYCODE_A, 1, 0x41); // 'A'
        bind(KEYCODE_CAPS, 0, u32::from(KEY_Caps_Lock));
        bind(KEYCODE_NUM, 0, u32::from(KEY_Num_Lock));
        bind(KEYCODE_MODE, 0, u32::from(KEY_Mode_switch));
        KeysymTable::new(first, per_keycode, keysyms)
    }

    // Modifier table with 2 keycodes per modifier: CapsLock on Lock,
    // NumLock on Mod2, ModeSwitch on Mod5.
    fn modifier_map() -> Vec<Keycode> {
        let mut map = vec![0u8; 16];
        map[1 * 2] = KEYCODE_CAPS;
        map[4 * 2] = KEYCODE_NUM;
        map[7 * 2] = KEYCODE_MODE;
        map
    }

    #[test]
    fn resolves_lock_bits() {
        let masks = resolve_lock_masks(&modifier_map(), &table());
        assert_eq!(masks.capslock, 1 << 1);
        assert_eq!(masks.numlock, 1 << 4);
        assert_eq!(masks.modeswitch, 1 << 7);
        assert_eq!(masks.shiftlock, 0);
    }

    #[test]
    fn unbound_modifiers_resolve_to_zero() {
        let masks = resolve_lock_masks(&vec![0u8; 16], &table());
        assert_eq!(masks, LockMasks::default());
    }

    #[test]
    fn strip_removes_only_lock_bits() {
        let masks = resolve_lock_masks(&modifier_map(), &table());
        let state = u16::from(KeyButMask::SHIFT) | masks.numlock | masks.capslock;
        assert_eq!(masks.strip(state), u16::from(KeyButMask::SHIFT));
    }

    #[test]
    fn lookup_follows_shift() {
        let table = table();
        let masks = resolve_lock_masks(&modifier_map(), &table);
        assert_eq!(table.lookup(KEYCODE_A, 0, &masks), Some(0x61));
        assert_eq!(
            table.lookup(KEYCODE_A, u16::from(KeyButMask::SHIFT), &masks),
            Some(0x41)
        );
    }

    #[test]
    fn lookup_out_of_range_keycode() {
        let table = table();
        let masks = LockMasks::default();
        assert_eq!(table.lookup(5, 0, &masks), None);
    }
}
