//! 轻量随机数：每线程一个 xorshift64* state，避免锁与额外依赖。

use std::cell::Cell;

thread_local! {
    static RNG_STATE: Cell<u64> = Cell::new(seed());
}

fn seed() -> u64 {
    // 以 uuid v4 作为随机种子（仅在首次初始化线程本地 state 时调用一次）。
    let u = uuid::Uuid::new_v4().as_u128();
    let mut s = (u as u64) ^ ((u >> 64) as u64);
    if s == 0 {
        // 避免 xorshift 的零种子退化。
        s = 0x9E37_79B9_7F4A_7C15;
    }
    s
}

pub fn next_u64() -> u64 {
    RNG_STATE.with(|state| {
        // xorshift64*
        let mut x = state.get();
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        state.set(x);
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    })
}

/// [0, 1) 的均匀浮点数。
pub fn next_f64() -> f64 {
    (next_u64() >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_f64_in_unit_range() {
        for _ in 0..1000 {
            let x = next_f64();
            assert!((0.0..1.0).contains(&x));
        }
    }

    #[test]
    fn next_u64_varies() {
        let a = next_u64();
        let b = next_u64();
        let c = next_u64();
        assert!(a != b || b != c);
    }
}
