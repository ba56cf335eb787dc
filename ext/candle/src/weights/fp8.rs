/// FP8 E4M3FN (used by the `t5xxl_fp8_e4m3fn` text encoder checkpoints)
/// Sign: 1 bit, Exponent: 4 bits, Mantissa: 3 bits. No infinities; only
/// `S.1111.111` encodes NaN, so the largest finite value is 448.
#[derive(Debug, Clone, Copy)]
pub struct Fp8E4M3(pub u8);

impl Fp8E4M3 {
    const BIAS: i32 = 7;

    pub fn to_f32(self) -> f32 {
        let bits = self.0;
        let sign = if bits & 0x80 != 0 { -1.0 } else { 1.0 };
        let exponent = (bits >> 3) & 0xF;
        let mantissa = bits & 0x7;

        if exponent == 0xF && mantissa == 0x7 {
            return f32::NAN;
        }

        if exponent == 0 {
            // Subnormal: 0.mmm * 2^(1 - bias)
            return sign * (mantissa as f32 / 8.0) * 2.0f32.powi(1 - Self::BIAS);
        }

        let unbiased_exp = exponent as i32 - Self::BIAS;
        sign * (1.0 + mantissa as f32 / 8.0) * 2.0f32.powi(unbiased_exp)
    }
}

/// Decode a buffer of FP8 E4M3FN values to f32
pub fn fp8_e4m3_to_f32(data: &[u8]) -> Vec<f32> {
    data.iter().map(|&byte| Fp8E4M3(byte).to_f32()).collect()
}
