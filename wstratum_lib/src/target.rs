// Copyright (C) 2024, 2025 Wstratum Developers (see AUTHORS)
//
// This file is part of Wstratum
//
// Wstratum is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wstratum is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// Wstratum. If not, see <https://www.gnu.org/licenses/>.

use num_bigint::BigUint;

/// Convert a difficulty to the compact target hex pools hand to miners.
///
/// The full target is the 256-bit maximum divided by the difficulty;
/// miners compare against its four most significant bytes, transmitted
/// in little-endian order. A difficulty of 0 is treated as 1.
pub fn difficulty_to_target(difficulty: u64) -> String {
    let difficulty = difficulty.max(1);
    let max_target = BigUint::from_bytes_be(&[0xFFu8; 32]);
    let target = max_target / BigUint::from(difficulty);
    // The top 32 bits of a 256-bit value.
    let compact_bits: BigUint = target >> 224u32;
    let compact = compact_bits.iter_u32_digits().next().unwrap_or(0);
    hex::encode(compact.to_le_bytes())
}
