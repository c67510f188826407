//! 32x32 matrices over GF(2).
//!
//! Row `i` holds the coefficients of output bit `i`, so applying a matrix to a
//! vector is one parity computation per row.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gf2Matrix {
    rows: [u32; 32],
}

impl Gf2Matrix {
    pub const fn identity() -> Self {
        let mut rows = [0u32; 32];
        let mut i = 0;
        while i < 32 {
            rows[i] = 1 << i;
            i += 1;
        }
        Self { rows }
    }

    /// Builds the matrix of a linear map from its images of the unit vectors.
    pub fn from_fn(f: impl Fn(u32) -> u32) -> Self {
        let mut rows = [0u32; 32];
        for col in 0..32 {
            let image = f(1 << col);
            for (row, bits) in rows.iter_mut().enumerate() {
                if image & (1 << row) != 0 {
                    *bits |= 1 << col;
                }
            }
        }
        Self { rows }
    }

    pub fn apply(&self, v: u32) -> u32 {
        self.rows
            .iter()
            .enumerate()
            .fold(0, |acc, (i, row)| acc | (((row & v).count_ones() & 1) << i))
    }

    /// `self * rhs`: applies `rhs` first, then `self`.
    pub fn compose(&self, rhs: &Self) -> Self {
        let mut rows = [0u32; 32];
        for (out, row) in rows.iter_mut().zip(self.rows.iter()) {
            let mut bits = *row;
            while bits != 0 {
                let j = bits.trailing_zeros() as usize;
                *out ^= rhs.rows[j];
                bits &= bits - 1;
            }
        }
        Self { rows }
    }

    pub fn pow(&self, mut exp: u64) -> Self {
        let mut result = Self::identity();
        let mut base = *self;
        while exp != 0 {
            if exp & 1 != 0 {
                result = result.compose(&base);
            }
            base = base.compose(&base);
            exp >>= 1;
        }
        result
    }

    /// Gauss-Jordan elimination. `None` if the matrix is singular.
    pub fn inverse(&self) -> Option<Self> {
        let mut rows = self.rows;
        let mut inv = Self::identity().rows;

        for col in 0..32 {
            let pivot = (col..32).find(|&r| rows[r] & (1 << col) != 0)?;
            rows.swap(col, pivot);
            inv.swap(col, pivot);

            for r in 0..32 {
                if r != col && rows[r] & (1 << col) != 0 {
                    rows[r] ^= rows[col];
                    inv[r] ^= inv[col];
                }
            }
        }

        Some(Self { rows: inv })
    }
}
