//! Ring element types for the arithmetic and boolean evaluators.
//!
//! All secret values live in `Z_{2^64}` represented by [`Ring`], a `u64`
//! with wrapping arithmetic. The sign-extraction sub-circuit works over
//! GF(2) represented by [`BoolRing`]. Fixed-point values use an implicit
//! binary point at [`FRACTION`] bits.

use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Mul, MulAssign, Neg, Sub, SubAssign},
};

use bytemuck::{Pod, Zeroable};
use rand::{Rng, distr::StandardUniform, prelude::Distribution};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Number of fractional bits in fixed-point encoded values.
pub const FRACTION: u32 = 16;

/// Bit width of the comparison blind `mu_1` (and bound for `mu_2`).
pub const BITS_BETA: u32 = 4;

/// Bit width reserved for the integral part of comparison inputs.
pub const BITS_GAMMA: u32 = 20;

/// Element of a finite ring with the operations the share arithmetic needs.
///
/// Implemented by [`Ring`] (mod-`2^64` integers) and [`BoolRing`] (GF(2)).
/// Addition and subtraction coincide for GF(2), which the boolean masked
/// evaluation relies on.
pub trait RingElem:
    Copy
    + Clone
    + fmt::Debug
    + Default
    + PartialEq
    + Eq
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + SubAssign
    + Sum
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
    /// Additive identity.
    const ZERO: Self;
    /// Multiplicative identity.
    const ONE: Self;
    /// Width of one element in the little-endian bulk wire format.
    const BYTES: usize;

    /// Draws a uniform element from `rng`.
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self;

    /// Appends the element to `out` in the bulk wire format.
    fn write_le(&self, out: &mut Vec<u8>);

    /// Reads one element from a [`Self::BYTES`]-sized prefix of `bytes`.
    fn read_le(bytes: &[u8]) -> Self;

    /// Byte length of `len` elements in the bulk wire format.
    fn encoded_len(len: usize) -> usize {
        len * Self::BYTES
    }

    /// Serializes a slice in the bulk wire format. Boolean elements pack
    /// eight to a byte, LSB first.
    fn encode_slice(elems: &[Self]) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::encoded_len(elems.len()));
        for e in elems {
            e.write_le(&mut out);
        }
        out
    }

    /// Inverse of [`Self::encode_slice`] for a known element count.
    fn decode_slice(bytes: &[u8], len: usize) -> Result<Vec<Self>, WrongPayloadLength> {
        if bytes.len() != Self::encoded_len(len) {
            return Err(WrongPayloadLength {
                expected: Self::encoded_len(len),
                actual: bytes.len(),
            });
        }
        Ok((0..len)
            .map(|i| Self::read_le(&bytes[i * Self::BYTES..]))
            .collect())
    }
}

/// An element of `Z_{2^64}`. All arithmetic wraps.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable,
)]
#[repr(transparent)]
pub struct Ring(pub u64);

impl Ring {
    /// The additive identity.
    pub const ZERO: Self = Self(0);
    /// The multiplicative identity.
    pub const ONE: Self = Self(1);

    /// Inner `u64` value.
    #[inline]
    pub fn val(self) -> u64 {
        self.0
    }

    /// Logical right shift, the fixed-point truncation primitive.
    #[inline]
    pub fn shr(self, bits: u32) -> Self {
        Self(self.0 >> bits)
    }

    /// Bit at position `i`, LSB first.
    #[inline]
    pub fn bit(self, i: u32) -> bool {
        (self.0 >> i) & 1 == 1
    }

    /// The 64 bits of the element, LSB first.
    pub fn bits(self) -> [BoolRing; 64] {
        let mut out = [BoolRing::ZERO; 64];
        for (i, bit) in out.iter_mut().enumerate() {
            *bit = BoolRing(self.0 >> i & 1 == 1);
        }
        out
    }
}

impl From<u64> for Ring {
    #[inline]
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl fmt::Display for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Add for Ring {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl Sub for Ring {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl Mul for Ring {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self(self.0.wrapping_mul(rhs.0))
    }
}

impl Neg for Ring {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        Self(self.0.wrapping_neg())
    }
}

impl AddAssign for Ring {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl SubAssign for Ring {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl MulAssign for Ring {
    #[inline]
    fn mul_assign(&mut self, rhs: Self) {
        *self = *self * rhs;
    }
}

impl Sum for Ring {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, v| acc + v)
    }
}

impl Distribution<Ring> for StandardUniform {
    #[inline]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Ring {
        Ring(rng.next_u64())
    }
}

impl RingElem for Ring {
    const ZERO: Self = Self::ZERO;
    const ONE: Self = Self::ONE;
    const BYTES: usize = 8;

    #[inline]
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.random()
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.0.to_le_bytes());
    }

    fn read_le(bytes: &[u8]) -> Self {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(&bytes[..8]);
        Self(u64::from_le_bytes(arr))
    }
}

/// An element of GF(2). `+` and `-` are XOR, `*` is AND.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct BoolRing(pub bool);

impl BoolRing {
    /// The additive identity.
    pub const ZERO: Self = Self(false);
    /// The multiplicative identity.
    pub const ONE: Self = Self(true);

    /// Inner boolean value.
    #[inline]
    pub fn val(self) -> bool {
        self.0
    }
}

impl From<bool> for BoolRing {
    #[inline]
    fn from(v: bool) -> Self {
        Self(v)
    }
}

impl Add for BoolRing {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Self(self.0 ^ rhs.0)
    }
}

impl Sub for BoolRing {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 ^ rhs.0)
    }
}

impl Mul for BoolRing {
    type Output = Self;

    #[inline]
    fn mul(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Neg for BoolRing {
    type Output = Self;

    #[inline]
    fn neg(self) -> Self {
        self
    }
}

impl AddAssign for BoolRing {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.0 ^= rhs.0;
    }
}

impl SubAssign for BoolRing {
    #[inline]
    fn sub_assign(&mut self, rhs: Self) {
        self.0 ^= rhs.0;
    }
}

impl Sum for BoolRing {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, |acc, v| acc + v)
    }
}

impl Distribution<BoolRing> for StandardUniform {
    #[inline]
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> BoolRing {
        BoolRing(rng.next_u64() & 1 == 1)
    }
}

impl RingElem for BoolRing {
    const ZERO: Self = Self::ZERO;
    const ONE: Self = Self::ONE;
    const BYTES: usize = 1;

    #[inline]
    fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        rng.random()
    }

    fn write_le(&self, out: &mut Vec<u8>) {
        out.push(self.0 as u8);
    }

    fn read_le(bytes: &[u8]) -> Self {
        Self(bytes[0] & 1 == 1)
    }

    fn encoded_len(len: usize) -> usize {
        len.div_ceil(8)
    }

    fn encode_slice(elems: &[Self]) -> Vec<u8> {
        pack_bools(elems)
    }

    fn decode_slice(bytes: &[u8], len: usize) -> Result<Vec<Self>, WrongPayloadLength> {
        if bytes.len() != Self::encoded_len(len) {
            return Err(WrongPayloadLength {
                expected: Self::encoded_len(len),
                actual: bytes.len(),
            });
        }
        Ok(unpack_bools(bytes, len))
    }
}

/// Packs booleans into bytes, LSB first, for bulk transfer.
pub fn pack_bools(bits: &[BoolRing]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if bit.0 {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}

/// Inverse of [`pack_bools`] for a known element count.
pub fn unpack_bools(bytes: &[u8], len: usize) -> Vec<BoolRing> {
    (0..len)
        .map(|i| BoolRing(bytes[i / 8] >> (i % 8) & 1 == 1))
        .collect()
}

/// Raised when a bulk payload's length does not match the expected
/// element count.
#[derive(Debug, Error)]
#[error("payload of {actual} bytes where {expected} were expected")]
pub struct WrongPayloadLength {
    /// Byte length the receiver registered for the transfer.
    pub expected: usize,
    /// Byte length actually received.
    pub actual: usize,
}

/// Serializes a slice of ring elements in the bulk wire format.
pub fn elems_to_bytes<T: RingElem>(elems: &[T]) -> Vec<u8> {
    let mut out = Vec::with_capacity(elems.len() * T::BYTES);
    for e in elems {
        e.write_le(&mut out);
    }
    out
}

/// Deserializes a slice of `len` ring elements from the bulk wire format.
pub fn elems_from_bytes<T: RingElem>(
    bytes: &[u8],
    len: usize,
) -> Result<Vec<T>, WrongPayloadLength> {
    if bytes.len() != len * T::BYTES {
        return Err(WrongPayloadLength {
            expected: len * T::BYTES,
            actual: bytes.len(),
        });
    }
    Ok((0..len)
        .map(|i| T::read_le(&bytes[i * T::BYTES..]))
        .collect())
}
