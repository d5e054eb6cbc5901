//! Positional XOR checksum.
//!
//! This is a deliberately cheap integrity tag: two bytes computed by
//! XOR-ing a handful of positions spread across the input. It detects the
//! common corruption cases on a framed stream but is neither a MAC nor a
//! robust error-detecting code. Sender and receiver only need to compute
//! it identically.

/// Computes the 2-byte tag for `data`. Empty input signs to `[0, 0]`.
pub fn sign(data: &[u8]) -> [u8; 2] {
    if data.is_empty() {
        return [0, 0];
    }
    let n = data.len();
    let x = if n > 21 { n / 7 } else { 3 };

    let b0 = data[n - 1]
        ^ data[(x + n % 17) % n]
        ^ data[(2 * x + n % 13) % n]
        ^ data[(3 * x + n % 11) % n];
    let b1 = data[(4 * x - n % 7) % n]
        ^ data[(5 * x - n % 5) % n]
        ^ data[(6 * x - n % 3) % n]
        ^ data[(7 * x - 1 - n % 2) % n];

    [b0, b1]
}
