//! Freed executable memory is overwritten with a trapping instruction so a
//! stale indirect call into it faults immediately instead of running
//! whatever bytes the next tenant left there.

/// `int3` — one byte, traps unconditionally.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
const TRAP_PATTERN: &[u8] = &[0xCC];

/// `udf #0` (A32 encoding, little-endian).
#[cfg(target_arch = "arm")]
const TRAP_PATTERN: &[u8] = &[0xF0, 0x00, 0xF0, 0xE7];

/// `brk #0` (little-endian).
#[cfg(target_arch = "aarch64")]
const TRAP_PATTERN: &[u8] = &[0x00, 0x00, 0x20, 0xD4];

#[cfg(not(any(
    target_arch = "x86",
    target_arch = "x86_64",
    target_arch = "arm",
    target_arch = "aarch64"
)))]
compile_error!("codeheap has no trap instruction encoding for this architecture.");

/// Fill `buffer` with the target's trap instruction, repeated. A trailing
/// slot shorter than one instruction is padded with the pattern's lead bytes;
/// it can never be reached as an instruction boundary from within the filled
/// region.
pub(crate) fn fill_trap(buffer: &mut [u8]) {
    let mut chunks = buffer.chunks_exact_mut(TRAP_PATTERN.len());
    for chunk in &mut chunks {
        chunk.copy_from_slice(TRAP_PATTERN);
    }
    let rem = chunks.into_remainder();
    let len = rem.len();
    rem.copy_from_slice(&TRAP_PATTERN[..len]);
}

/// True when `buffer` consists of whole trap instructions (plus an optional
/// truncated trailing one).
#[cfg(test)]
pub(crate) fn is_trap_filled(buffer: &[u8]) -> bool {
    buffer
        .chunks(TRAP_PATTERN.len())
        .all(|chunk| chunk == &TRAP_PATTERN[..chunk.len()])
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_fill_exact_multiple() {
        let mut buf = vec![0u8; TRAP_PATTERN.len() * 8];
        fill_trap(&mut buf);
        for chunk in buf.chunks(TRAP_PATTERN.len()) {
            assert_eq!(chunk, TRAP_PATTERN);
        }
    }

    #[test]
    fn test_fill_with_remainder() {
        // One byte longer than a whole number of instructions.
        let mut buf = vec![0u8; TRAP_PATTERN.len() * 3 + 1];
        fill_trap(&mut buf);
        assert_eq!(buf[buf.len() - 1], TRAP_PATTERN[0]);
        assert!(is_trap_filled(&buf));
    }

    #[test]
    fn test_fill_shorter_than_instruction() {
        let mut buf = vec![0u8; 1];
        fill_trap(&mut buf);
        assert_eq!(buf[0], TRAP_PATTERN[0]);
    }

    #[test]
    fn test_fill_empty() {
        let mut buf: [u8; 0] = [];
        fill_trap(&mut buf);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x64_pattern_is_int3() {
        let mut buf = [0u8; 4];
        fill_trap(&mut buf);
        assert_eq!(buf, [0xCC; 4]);
    }
}
