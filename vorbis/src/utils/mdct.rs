//! Inverse MDCT over precomputed twiddle tables.
//!
//! One [`Mdct`] instance serves one block size; the decoder keeps one per
//! configured size. The transform runs in place over the first n/2 slots of
//! `buffer` and expands to n samples, using a caller-provided scratch vector
//! so instances stay shareable without interior locking.
//!
//! The staged radix structure (reflect, butterfly cascade, bit-reversal
//! shuffle, final rotation) follows the classic split-radix FFT formulation
//! of the transform and is deterministic in f32 for identical input.

use crate::utils::bits::{bit_reverse, ilog};

use std::f64::consts::PI;

pub struct Mdct {
    n: usize,
    n2: usize,
    n4: usize,
    n8: usize,

    a: Vec<f32>,
    b: Vec<f32>,
    c: Vec<f32>,
    bitrev: Vec<u16>,
}

impl Mdct {
    pub fn new(n: usize) -> Self {
        let n2 = n >> 1;
        let n4 = n2 >> 1;
        let n8 = n4 >> 1;

        let ld = ilog(n as u32) - 1;

        let mut a = vec![0f32; n2];
        let mut b = vec![0f32; n2];
        let mut c = vec![0f32; n4];

        let nf = n as f64;
        for k in 0..n4 {
            let k2 = k * 2;
            a[k2] = (4.0 * k as f64 * PI / nf).cos() as f32;
            a[k2 + 1] = -((4.0 * k as f64 * PI / nf).sin()) as f32;
            b[k2] = ((k2 + 1) as f64 * PI / nf / 2.0).cos() as f32 * 0.5;
            b[k2 + 1] = ((k2 + 1) as f64 * PI / nf / 2.0).sin() as f32 * 0.5;
        }
        for k in 0..n8 {
            let k2 = k * 2;
            c[k2] = (2.0 * (k2 + 1) as f64 * PI / nf).cos() as f32;
            c[k2 + 1] = -((2.0 * (k2 + 1) as f64 * PI / nf).sin()) as f32;
        }

        let bitrev = (0..n8)
            .map(|i| (bit_reverse(i as u32, ld - 3) << 2) as u16)
            .collect();

        Self {
            n,
            n2,
            n4,
            n8,
            a,
            b,
            c,
            bitrev,
        }
    }

    pub fn block_size(&self) -> usize {
        self.n
    }

    /// Runs the inverse transform over `buffer[..n]` in place.
    ///
    /// The first n/2 slots hold spectral input; all n slots hold time-domain
    /// output on return. `scratch` is resized to n/2 as needed.
    pub fn reverse(&self, buffer: &mut [f32], scratch: &mut Vec<f32>) {
        scratch.resize(self.n2, 0.0);
        let buf2 = &mut scratch[..];

        let ld = ilog(self.n as u32) as i32 - 1;

        // step 0: copy and reflect spectral data
        {
            let mut d = self.n2 as isize - 2;
            let mut aa = 0usize;
            let mut e = 0usize;
            let e_stop = self.n2;
            while e != e_stop {
                buf2[d as usize + 1] = buffer[e] * self.a[aa] - buffer[e + 2] * self.a[aa + 1];
                buf2[d as usize] = buffer[e] * self.a[aa + 1] + buffer[e + 2] * self.a[aa];
                d -= 2;
                aa += 2;
                e += 4;
            }

            let mut e = self.n2 as isize - 3;
            while d >= 0 {
                buf2[d as usize + 1] =
                    -buffer[e as usize + 2] * self.a[aa] - -buffer[e as usize] * self.a[aa + 1];
                buf2[d as usize] =
                    -buffer[e as usize + 2] * self.a[aa + 1] + -buffer[e as usize] * self.a[aa];
                d -= 2;
                aa += 2;
                e -= 4;
            }
        }

        let u = &mut buffer[..];
        let v = buf2;

        // step 2
        {
            let mut aa = self.n2 as isize - 8;

            let mut e0 = self.n4;
            let mut e1 = 0usize;

            let mut d0 = self.n4;
            let mut d1 = 0usize;

            while aa >= 0 {
                let a = aa as usize;

                let mut v41_21 = v[e0 + 1] - v[e1 + 1];
                let mut v40_20 = v[e0] - v[e1];
                u[d0 + 1] = v[e0 + 1] + v[e1 + 1];
                u[d0] = v[e0] + v[e1];
                u[d1 + 1] = v41_21 * self.a[a + 4] - v40_20 * self.a[a + 5];
                u[d1] = v40_20 * self.a[a + 4] + v41_21 * self.a[a + 5];

                v41_21 = v[e0 + 3] - v[e1 + 3];
                v40_20 = v[e0 + 2] - v[e1 + 2];
                u[d0 + 3] = v[e0 + 3] + v[e1 + 3];
                u[d0 + 2] = v[e0 + 2] + v[e1 + 2];
                u[d1 + 3] = v41_21 * self.a[a] - v40_20 * self.a[a + 1];
                u[d1 + 2] = v40_20 * self.a[a] + v41_21 * self.a[a + 1];

                aa -= 8;

                d0 += 4;
                d1 += 4;
                e0 += 4;
                e1 += 4;
            }
        }

        // step 3
        let n = self.n;
        let n2 = self.n2;
        let n4 = self.n4;
        let n8 = self.n8;

        // the combined tail loop always handles the last three stages, so the
        // fixed iterations only run when deeper stages remain above them
        if n >= 128 {
            // iteration 0
            self.step3_iter0_loop(n >> 4, u, (n2 - 1) as isize, -(n8 as isize));
            self.step3_iter0_loop(n >> 4, u, (n2 - 1 - n4) as isize, -(n8 as isize));
        }

        if n >= 256 {
            // iteration 1
            for i in 0..4 {
                self.step3_inner_r_loop(
                    n >> 5,
                    u,
                    (n2 - 1 - n8 * i) as isize,
                    -((n >> 4) as isize),
                    16,
                );
            }
        }

        // iterations 2 ... x
        let mut l = 2;
        while l < (ld - 3) >> 1 {
            let k0 = n >> (l + 2);
            let k0_2 = k0 >> 1;
            let lim = 1usize << (l + 1);
            for i in 0..lim {
                self.step3_inner_r_loop(
                    n >> (l + 4),
                    u,
                    (n2 - 1 - k0 * i) as isize,
                    -(k0_2 as isize),
                    1 << (l + 3),
                );
            }
            l += 1;
        }

        // iterations x ... end
        while l < ld - 6 {
            let k0 = n >> (l + 2);
            let k1 = 1usize << (l + 3);
            let k0_2 = k0 >> 1;
            let rlim = n >> (l + 6);
            let lim = 1usize << (l + 1);
            let mut i_off = (n2 - 1) as isize;
            let mut a0 = 0usize;

            for _ in 0..rlim {
                self.step3_inner_s_loop(lim, u, i_off, -(k0_2 as isize), a0, k1, k0 as isize);
                a0 += k1 * 4;
                i_off -= 8;
            }
            l += 1;
        }

        // combine the last few iteration steps
        self.step3_inner_s_loop_ld654(n >> 5, u, (n2 - 1) as isize, n as isize);

        // steps 4, 5, and 6
        {
            let mut bit = 0usize;

            let mut d0 = n4 as isize - 4;
            let mut d1 = n2 as isize - 4;
            while d0 >= 0 {
                let mut k4 = self.bitrev[bit] as usize;
                v[d1 as usize + 3] = u[k4];
                v[d1 as usize + 2] = u[k4 + 1];
                v[d0 as usize + 3] = u[k4 + 2];
                v[d0 as usize + 2] = u[k4 + 3];

                k4 = self.bitrev[bit + 1] as usize;
                v[d1 as usize + 1] = u[k4];
                v[d1 as usize] = u[k4 + 1];
                v[d0 as usize + 1] = u[k4 + 2];
                v[d0 as usize] = u[k4 + 3];

                d0 -= 4;
                d1 -= 4;
                bit += 2;
            }
        }

        // step 7
        {
            let mut c = 0usize;
            let mut d = 0usize;
            let mut e = n2 - 4;

            while d < e {
                let mut a02 = v[d] - v[e + 2];
                let mut a11 = v[d + 1] + v[e + 3];

                let mut b0 = self.c[c + 1] * a02 + self.c[c] * a11;
                let mut b1 = self.c[c + 1] * a11 - self.c[c] * a02;

                let mut b2 = v[d] + v[e + 2];
                let mut b3 = v[d + 1] - v[e + 3];

                v[d] = b2 + b0;
                v[d + 1] = b3 + b1;
                v[e + 2] = b2 - b0;
                v[e + 3] = b1 - b3;

                a02 = v[d + 2] - v[e];
                a11 = v[d + 3] + v[e + 1];

                b0 = self.c[c + 3] * a02 + self.c[c + 2] * a11;
                b1 = self.c[c + 3] * a11 - self.c[c + 2] * a02;

                b2 = v[d + 2] + v[e];
                b3 = v[d + 3] - v[e + 1];

                v[d + 2] = b2 + b0;
                v[d + 3] = b3 + b1;
                v[e] = b2 - b0;
                v[e + 1] = b1 - b3;

                c += 4;
                d += 4;
                e -= 4;
            }
        }

        // step 8 + decode
        {
            let mut b = n2 as isize - 8;
            let mut e = n2 as isize - 8;
            let mut d0 = 0usize;
            let mut d1 = n2 - 4;
            let mut d2 = n2;
            let mut d3 = n - 4;
            while e >= 0 {
                let eu = e as usize;
                let bu = b as usize;

                let mut p3 = v[eu + 6] * self.b[bu + 7] - v[eu + 7] * self.b[bu + 6];
                let mut p2 = -v[eu + 6] * self.b[bu + 6] - v[eu + 7] * self.b[bu + 7];

                u[d0] = p3;
                u[d1 + 3] = -p3;
                u[d2] = p2;
                u[d3 + 3] = p2;

                let mut p1 = v[eu + 4] * self.b[bu + 5] - v[eu + 5] * self.b[bu + 4];
                let mut p0 = -v[eu + 4] * self.b[bu + 4] - v[eu + 5] * self.b[bu + 5];

                u[d0 + 1] = p1;
                u[d1 + 2] = -p1;
                u[d2 + 1] = p0;
                u[d3 + 2] = p0;

                p3 = v[eu + 2] * self.b[bu + 3] - v[eu + 3] * self.b[bu + 2];
                p2 = -v[eu + 2] * self.b[bu + 2] - v[eu + 3] * self.b[bu + 3];

                u[d0 + 2] = p3;
                u[d1 + 1] = -p3;
                u[d2 + 2] = p2;
                u[d3 + 1] = p2;

                p1 = v[eu] * self.b[bu + 1] - v[eu + 1] * self.b[bu];
                p0 = -v[eu] * self.b[bu] - v[eu + 1] * self.b[bu + 1];

                u[d0 + 3] = p1;
                u[d1] = -p1;
                u[d2 + 3] = p0;
                u[d3] = p0;

                b -= 8;
                e -= 8;
                d0 += 4;
                d2 += 4;
                d1 -= 4;
                d3 -= 4;
            }
        }
    }

    fn step3_iter0_loop(&self, n: usize, e: &mut [f32], i_off: isize, k_off: isize) {
        let mut ee0 = i_off;
        let mut ee2 = ee0 + k_off;
        let mut a = 0usize;
        for _ in 0..(n >> 2) {
            for j in 0..4isize {
                let e0 = (ee0 - j * 2) as usize;
                let e2 = (ee2 - j * 2) as usize;

                let k00_20 = e[e0] - e[e2];
                let k01_21 = e[e0 - 1] - e[e2 - 1];
                e[e0] += e[e2];
                e[e0 - 1] += e[e2 - 1];
                e[e2] = k00_20 * self.a[a] - k01_21 * self.a[a + 1];
                e[e2 - 1] = k01_21 * self.a[a] + k00_20 * self.a[a + 1];
                a += 8;
            }

            ee0 -= 8;
            ee2 -= 8;
        }
    }

    fn step3_inner_r_loop(&self, lim: usize, e: &mut [f32], d0: isize, k_off: isize, k1: usize) {
        let mut e0 = d0;
        let mut e2 = e0 + k_off;
        let mut a = 0usize;

        for _ in 0..(lim >> 2) {
            for j in 0..4isize {
                let p0 = (e0 - j * 2) as usize;
                let p2 = (e2 - j * 2) as usize;

                let k00_20 = e[p0] - e[p2];
                let k01_21 = e[p0 - 1] - e[p2 - 1];
                e[p0] += e[p2];
                e[p0 - 1] += e[p2 - 1];
                e[p2] = k00_20 * self.a[a] - k01_21 * self.a[a + 1];
                e[p2 - 1] = k01_21 * self.a[a] + k00_20 * self.a[a + 1];

                a += k1;
            }

            e0 -= 8;
            e2 -= 8;
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step3_inner_s_loop(
        &self,
        n: usize,
        e: &mut [f32],
        i_off: isize,
        k_off: isize,
        a: usize,
        a_off: usize,
        k0: isize,
    ) {
        let tw = [
            [self.a[a], self.a[a + 1]],
            [self.a[a + a_off], self.a[a + a_off + 1]],
            [self.a[a + a_off * 2], self.a[a + a_off * 2 + 1]],
            [self.a[a + a_off * 3], self.a[a + a_off * 3 + 1]],
        ];

        let mut ee0 = i_off;
        let mut ee2 = ee0 + k_off;

        for _ in 0..n {
            for (j, t) in tw.iter().enumerate() {
                let p0 = (ee0 - j as isize * 2) as usize;
                let p2 = (ee2 - j as isize * 2) as usize;

                let k00 = e[p0] - e[p2];
                let k11 = e[p0 - 1] - e[p2 - 1];
                e[p0] += e[p2];
                e[p0 - 1] += e[p2 - 1];
                e[p2] = k00 * t[0] - k11 * t[1];
                e[p2 - 1] = k11 * t[0] + k00 * t[1];
            }

            ee0 -= k0;
            ee2 -= k0;
        }
    }

    fn step3_inner_s_loop_ld654(&self, n: usize, e: &mut [f32], i_off: isize, base_n: isize) {
        let a_off = (base_n >> 3) as usize;
        let a2 = self.a[a_off];
        let mut z = i_off;
        let base = z - 16 * n as isize;

        while z > base {
            let zu = z as usize;

            let mut k00 = e[zu] - e[zu - 8];
            let mut k11 = e[zu - 1] - e[zu - 9];
            e[zu] += e[zu - 8];
            e[zu - 1] += e[zu - 9];
            e[zu - 8] = k00;
            e[zu - 9] = k11;

            k00 = e[zu - 2] - e[zu - 10];
            k11 = e[zu - 3] - e[zu - 11];
            e[zu - 2] += e[zu - 10];
            e[zu - 3] += e[zu - 11];
            e[zu - 10] = (k00 + k11) * a2;
            e[zu - 11] = (k11 - k00) * a2;

            k00 = e[zu - 12] - e[zu - 4];
            k11 = e[zu - 5] - e[zu - 13];
            e[zu - 4] += e[zu - 12];
            e[zu - 5] += e[zu - 13];
            e[zu - 12] = k11;
            e[zu - 13] = k00;

            k00 = e[zu - 14] - e[zu - 6];
            k11 = e[zu - 7] - e[zu - 15];
            e[zu - 6] += e[zu - 14];
            e[zu - 7] += e[zu - 15];
            e[zu - 14] = (k00 + k11) * a2;
            e[zu - 15] = (k00 - k11) * a2;

            iter_54(e, zu);
            iter_54(e, zu - 8);

            z -= 16;
        }
    }
}

fn iter_54(e: &mut [f32], z: usize) {
    let k00 = e[z] - e[z - 4];
    let y0 = e[z] + e[z - 4];
    let y2 = e[z - 2] + e[z - 6];
    let k22 = e[z - 2] - e[z - 6];

    e[z] = y0 + y2;
    e[z - 2] = y0 - y2;

    let k33 = e[z - 3] - e[z - 7];

    e[z - 4] = k00 + k33;
    e[z - 6] = k00 - k33;

    let k11 = e[z - 1] - e[z - 5];
    let y1 = e[z - 1] + e[z - 5];
    let y3 = e[z - 3] + e[z - 7];

    e[z - 1] = y1 + y3;
    e[z - 3] = y1 - y3;
    e[z - 5] = k11 - k22;
    e[z - 7] = k11 + k22;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Direct evaluation of the transform definition:
    // out[i] = sum_k in[k] * cos(pi/(2n) * (2i + 1 + n/2) * (2k + 1))
    fn naive_reverse(input: &[f32], n: usize) -> Vec<f32> {
        let mut out = vec![0f64; n];
        for (i, o) in out.iter_mut().enumerate() {
            for (k, &x) in input[..n / 2].iter().enumerate() {
                *o += x as f64
                    * (std::f64::consts::PI / (2.0 * n as f64)
                        * ((2 * i + 1) as f64 + n as f64 / 2.0)
                        * (2 * k + 1) as f64)
                        .cos();
            }
        }
        out.iter().map(|&x| x as f32).collect()
    }

    #[test]
    fn matches_direct_evaluation() {
        // every block size a stream may configure, including the short ones
        // that skip the early butterfly iterations
        for n in [64usize, 128, 256, 512] {
            let mdct = Mdct::new(n);

            let mut buffer = vec![0f32; n];
            for (k, v) in buffer[..n / 2].iter_mut().enumerate() {
                *v = ((k * 7 + 3) as f32 * 0.37).sin();
            }
            let expected = naive_reverse(&buffer, n);

            let mut scratch = Vec::new();
            mdct.reverse(&mut buffer, &mut scratch);

            for (got, want) in buffer.iter().zip(expected.iter()) {
                assert!((got - want).abs() < 1e-3, "n={n}: got {got}, want {want}");
            }
        }
    }

    #[test]
    fn impulse_response() {
        let n = 128;
        let mdct = Mdct::new(n);

        let mut buffer = vec![0f32; n];
        buffer[0] = 1.0;

        let mut scratch = Vec::new();
        mdct.reverse(&mut buffer, &mut scratch);

        for (i, &got) in buffer.iter().enumerate() {
            let want = (std::f64::consts::PI / (2.0 * n as f64)
                * ((2 * i + 1) as f64 + n as f64 / 2.0))
                .cos() as f32;
            assert!((got - want).abs() < 1e-4, "i={i}: got {got}, want {want}");
        }
    }

    #[test]
    fn deterministic_across_calls() {
        let n = 256;
        let mdct = Mdct::new(n);

        let mut first = vec![0f32; n];
        for (k, v) in first[..n / 2].iter_mut().enumerate() {
            *v = ((k as f32) * 0.11).cos();
        }
        let mut second = first.clone();

        let mut scratch = Vec::new();
        mdct.reverse(&mut first, &mut scratch);
        mdct.reverse(&mut second, &mut scratch);

        assert_eq!(first, second);
    }
}
