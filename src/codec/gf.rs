//! GF(2^8) arithmetic for the Cauchy code
//!
//! Field polynomial 0x14d with generator 2, the same field CM256 uses, so
//! parity produced by CM256-compatible senders decodes here.

use gf256::gf::gf;

#[gf(polynomial = 0x14d, generator = 0x2)]
pub type Gf256;

/// `MUL_TABLES.tables[y][x] = x * y`, built at compile time
struct MulTables {
    tables: [[u8; 256]; 256],
}

impl MulTables {
    const fn new() -> Self {
        let mut tables = [[0u8; 256]; 256];
        let mut y = 0usize;
        while y < 256 {
            let mut x = 0usize;
            while x < 256 {
                tables[y][x] = Self::mul(x as u8, y as u8);
                x += 1;
            }
            y += 1;
        }
        Self { tables }
    }

    const fn mul(a: u8, b: u8) -> u8 {
        let mut product = 0u16;
        let mut aa = a as u16;
        let mut bb = b;
        let mut i = 0;
        while i < 8 {
            if bb & 1 != 0 {
                product ^= aa;
            }
            aa <<= 1;
            bb >>= 1;
            i += 1;
        }

        let mut bit = 15;
        while bit >= 8 {
            if product & (1 << bit) != 0 {
                product ^= 0x14d << (bit - 8);
            }
            bit -= 1;
        }
        product as u8
    }
}

static MUL_TABLES: MulTables = MulTables::new();

/// Cauchy matrix element for parity row `x_i` and original column `y_j`
///
/// Normalised so the first parity row (`x_i == x_0`) is all ones:
/// `a_ij = (y_j + x_0) / (x_i + y_j)`.
#[inline]
pub fn cauchy_element(x_i: u8, x_0: u8, y_j: u8) -> Gf256 {
    (Gf256(y_j) + Gf256(x_0)) / (Gf256(x_i) + Gf256(y_j))
}

/// `dst ^= src`
#[inline]
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= *s;
    }
}

/// `dst ^= src * coeff`
#[inline]
pub fn mul_add_into(dst: &mut [u8], src: &[u8], coeff: Gf256) {
    match u8::from(coeff) {
        0 => {}
        1 => xor_into(dst, src),
        c => {
            let table = &MUL_TABLES.tables[c as usize];
            for (d, s) in dst.iter_mut().zip(src) {
                *d ^= table[*s as usize];
            }
        }
    }
}

/// Invert a square matrix in place with Gauss-Jordan elimination
///
/// Returns `None` when the matrix is singular.
pub fn invert(matrix: &[Gf256], n: usize) -> Option<Vec<Gf256>> {
    let mut work = matrix.to_vec();
    let mut inverse = vec![Gf256(0); n * n];
    for i in 0..n {
        inverse[i * n + i] = Gf256(1);
    }

    for col in 0..n {
        let pivot = (col..n).find(|&row| work[row * n + col] != Gf256(0))?;
        if pivot != col {
            for k in 0..n {
                work.swap(pivot * n + k, col * n + k);
                inverse.swap(pivot * n + k, col * n + k);
            }
        }

        let scale = Gf256(1) / work[col * n + col];
        for k in 0..n {
            work[col * n + k] = work[col * n + k] * scale;
            inverse[col * n + k] = inverse[col * n + k] * scale;
        }

        for row in 0..n {
            if row == col {
                continue;
            }
            let factor = work[row * n + col];
            if factor == Gf256(0) {
                continue;
            }
            for k in 0..n {
                let w = work[col * n + k];
                let v = inverse[col * n + k];
                work[row * n + k] = work[row * n + k] + factor * w;
                inverse[row * n + k] = inverse[row * n + k] + factor * v;
            }
        }
    }

    Some(inverse)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_match_field() {
        for a in [0u8, 1, 2, 3, 0x53, 0x80, 0xca, 0xff] {
            for b in [0u8, 1, 2, 7, 0x8e, 0xfe, 0xff] {
                assert_eq!(MUL_TABLES.tables[b as usize][a as usize], u8::from(Gf256(a) * Gf256(b)));
            }
        }
    }

    #[test]
    fn test_first_row_is_xor() {
        let x_0 = 10u8;
        for y in 0..x_0 {
            assert_eq!(cauchy_element(x_0, x_0, y), Gf256(1));
        }
    }

    #[test]
    fn test_invert_cauchy_submatrix() {
        let x_0 = 4u8;
        let rows = [4u8, 5, 6];
        let cols = [0u8, 2, 3];
        let n = rows.len();
        let matrix: Vec<Gf256> = rows
            .iter()
            .flat_map(|&r| cols.iter().map(move |&c| cauchy_element(r, x_0, c)))
            .collect();

        let inverse = invert(&matrix, n).unwrap();
        for i in 0..n {
            for j in 0..n {
                let mut sum = Gf256(0);
                for k in 0..n {
                    sum = sum + matrix[i * n + k] * inverse[k * n + j];
                }
                assert_eq!(sum, if i == j { Gf256(1) } else { Gf256(0) });
            }
        }
    }

    #[test]
    fn test_singular_matrix() {
        let matrix = vec![Gf256(3), Gf256(3), Gf256(3), Gf256(3)];
        assert!(invert(&matrix, 2).is_none());
    }
}
