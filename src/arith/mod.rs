/// Fixed-precision modular arithmetic shared by the device programs and the
/// host fallback path.
///
/// Key Features:
/// - 128-bit products emulated from 32x32 partial products (`double_word`)
/// - Barrett and Shoup modular multiplication (`modular`)
/// - Cache-sized elementwise kernels for every operation family (`elementwise`)
/// - Negacyclic NTT with bit-reversed twiddle tables (`ntt`)
///
/// Mathematical Precision:
/// - All results are bit-exact with arbitrary-precision references
/// - Residues are always kept fully reduced in `[0, m)`
pub mod double_word;
pub mod elementwise;
pub mod modular;
pub mod ntt;

pub use double_word::{get_msb, mult_d, DoubleWord};
pub use modular::{
    check_modulus, compute_mu, divide_and_round, mod_add, mod_exp, mod_inverse, mod_mul,
    mod_mul_fast, mod_sub, multiply_and_round, MAX_MODULUS_BITS,
};
pub use ntt::{
    bit_reverse, forward_transform_to_bit_reverse_in_place,
    inverse_transform_from_bit_reverse_in_place, RootTables,
};
