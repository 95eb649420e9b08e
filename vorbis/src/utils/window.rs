//! Raised-cosine block windows.
//!
//! Long-block modes carry four window shapes selected by whether the previous
//! and next blocks are short; short-block modes carry a single shape. The
//! slope is sin(pi/2 * sin^2(...)) on both flanks with a flat center.

/// Builds the window table for one mode.
///
/// Index bit 0 set means the previous block is long, bit 1 set means the next
/// block is long. Short-block modes get a single symmetric window.
pub fn build_windows(block_flag: bool, block0: usize, block1: usize) -> Vec<Vec<f32>> {
    let count = if block_flag { 4 } else { 1 };
    let block_size = if block_flag { block1 } else { block0 };

    let mut windows = Vec::with_capacity(count);
    for idx in 0..count {
        let mut window = vec![0f32; block_size];

        let left = (if idx & 1 == 0 { block0 } else { block1 }) / 2;
        let right = (if idx & 2 == 0 { block0 } else { block1 }) / 2;

        let left_begin = block_size / 4 - left / 2;
        let right_begin = block_size - block_size / 4 - right / 2;

        for i in 0..left {
            let x = ((i as f32 + 0.5) / left as f32 * std::f32::consts::FRAC_PI_2).sin();
            window[left_begin + i] = (x * x * std::f32::consts::FRAC_PI_2).sin();
        }

        for v in window[left_begin + left..right_begin].iter_mut() {
            *v = 1.0;
        }

        for i in 0..right {
            let x = ((right - i) as f32 - 0.5) / right as f32 * std::f32::consts::FRAC_PI_2;
            let x = x.sin();
            window[right_begin + i] = (x * x * std::f32::consts::FRAC_PI_2).sin();
        }

        windows.push(window);
    }

    windows
}

#[test]
fn short_mode_has_single_symmetric_window() {
    let windows = build_windows(false, 256, 2048);
    assert_eq!(windows.len(), 1);

    let w = &windows[0];
    assert_eq!(w.len(), 256);
    for i in 0..128 {
        assert!((w[i] - w[255 - i]).abs() < 1e-6);
    }
    // Flanks rise monotonically toward the center.
    assert!(w[0] > 0.0 && w[0] < 0.01);
    assert!(w[64] < w[127]);
}

#[test]
fn long_mode_has_four_window_shapes() {
    let windows = build_windows(true, 256, 2048);
    assert_eq!(windows.len(), 4);
    for w in &windows {
        assert_eq!(w.len(), 2048);
    }

    // Short-flank windows are fully open across the wide center.
    assert_eq!(windows[0][1024], 1.0);
    // Short-previous windows are zero before the narrow left flank begins.
    assert_eq!(windows[0][0], 0.0);
    assert_eq!(windows[2][0], 0.0);
    // Long-previous windows start rising immediately.
    assert!(windows[1][0] > 0.0);
    assert!(windows[3][0] > 0.0);
}

#[test]
fn lapped_flanks_sum_to_unity() {
    // sin^2 + cos^2 over the overlap keeps reconstruction lossless.
    let windows = build_windows(true, 256, 2048);
    let w = &windows[3];
    let half = w.len() / 2;
    for i in 0..half {
        let folded = w[i] * w[i] + w[half + i] * w[half + i];
        assert!((folded - 1.0).abs() < 1e-5);
    }
}
