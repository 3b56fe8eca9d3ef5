//! End-to-end scenarios wiring the parser, framebuffer, prediction engine
//! and differential display together, the way a client actually drives them
//! across a round trip, rather than testing any one module in isolation.

use std::time::{Duration, Instant};

use mosh_terminal::complete_terminal::CompleteTerminal;
use mosh_terminal::display;
use mosh_terminal::framebuffer::Framebuffer;
use mosh_terminal::prediction::{DisplayPreference, PredictionEngine};

fn differing_cells(a: &Framebuffer, b: &Framebuffer) -> usize {
    assert_eq!(a.width(), b.width());
    assert_eq!(a.height(), b.height());
    let mut count = 0;
    for row in 0..a.height() {
        for col in 0..a.width() {
            if a.row(row).cell(col) != b.row(row).cell(col) {
                count += 1;
            }
        }
    }
    count
}

/// Quiet echo ack: typing a character shows it locally (flagged, since the
/// default engine starts out assuming a slow link) before the host's own
/// echo of the same character arrives and the flag comes off.
#[test]
fn quiet_echo_ack_predicts_then_settles_without_extra_flicker() {
    let mut host = CompleteTerminal::new(10, 3);
    let before = host.fb().clone();

    let mut predictor = PredictionEngine::new();
    predictor.set_display_preference(DisplayPreference::Adaptive);

    let t0 = Instant::now();
    predictor.new_user_byte(b'a', &before, t0);
    predictor.set_local_frame_sent(1);

    let mut predicted = before.clone();
    predictor.cull(&before, t0);
    predictor.apply(&mut predicted);

    // One cell (the predicted, underlined 'a') differs from the pristine
    // screen.
    assert_eq!(differing_cells(&before, &predicted), 1);
    assert_eq!(predicted.row(0).cell(0).contents(), &['a']);
    assert!(predicted.row(0).cell(0).renditions.underlined);

    // The host's own echo of 'a' now arrives.
    host.act(b"a");
    let after_echo = host.fb().clone();
    predictor.set_local_frame_late_acked(2);

    let mut settled = after_echo.clone();
    predictor.cull(&after_echo, t0 + Duration::from_millis(150));
    predictor.apply(&mut settled);

    // The confirmed prediction is dropped; the settled frame matches the
    // real terminal exactly, with no leftover underline.
    assert_eq!(differing_cells(&after_echo, &settled), 0);
    assert!(!predictor.active());
}

/// Prediction retraction: three keystrokes are predicted, but the host only
/// echoes the first (a shell that consumed the rest as part of a command).
/// The whole in-flight epoch is killed rather than leaving stale glyphs.
#[test]
fn disagreeing_echo_retracts_the_whole_pending_epoch() {
    let fb = Framebuffer::new(10, 3);
    let mut predictor = PredictionEngine::new();
    predictor.set_display_preference(DisplayPreference::Always);
    predictor.set_send_interval(Duration::from_millis(400));

    let t0 = Instant::now();
    predictor.new_user_byte(b'a', &fb, t0);
    predictor.new_user_byte(b'b', &fb, t0);
    predictor.new_user_byte(b'c', &fb, t0);
    predictor.set_local_frame_sent(1);

    let mut predicted = fb.clone();
    predictor.cull(&fb, t0);
    predictor.apply(&mut predicted);
    assert_eq!(predicted.row(0).cell(0).contents(), &['a']);
    assert_eq!(predicted.row(0).cell(1).contents(), &['b']);
    assert_eq!(predicted.row(0).cell(2).contents(), &['c']);

    // The host only echoes 'a'; columns 1 and 2 stay blank.
    let mut real = fb.clone();
    real.row_mut(0).cell_mut(0).set_character('a');
    real.ds.cursor_col = 1;

    predictor.set_local_frame_late_acked(2);
    let mut shown = real.clone();
    predictor.cull(&real, t0 + Duration::from_millis(500));
    predictor.apply(&mut shown);

    // Every prediction is retracted -- the displayed frame matches the real
    // one exactly, not a partially-confirmed mix.
    assert_eq!(differing_cells(&real, &shown), 0);
    assert!(!predictor.active());
}

/// A synthesized diff round-trips through the differential display encoder:
/// applying `Display::new_frame(initialized, old, new)` to a fresh terminal
/// starting from `old` reproduces `new` cell-for-cell.
#[test]
fn display_diff_reconstructs_target_framebuffer() {
    let mut old_term = CompleteTerminal::new(20, 4);
    old_term.act(b"hello\r\nworld");

    let mut new_term = old_term.clone();
    new_term.act(b"\x1b[2;1Hgoodbye, wooorld!");

    let frame = display::new_frame(true, old_term.fb(), new_term.fb());

    let mut replay = old_term.clone();
    replay.act(frame.as_bytes());

    for row in 0..new_term.fb().height() {
        for col in 0..new_term.fb().width() {
            let expected = new_term.fb().row(row).cell(col);
            let got = replay.fb().row(row).cell(col);
            assert_eq!(
                got.contents(),
                expected.contents(),
                "row {row} col {col} mismatched"
            );
        }
    }
}

/// Disabled prediction must never alter what's displayed, even immediately
/// after a keystroke.
#[test]
fn disabled_prediction_never_changes_the_displayed_frame() {
    let fb = Framebuffer::new(10, 3);
    let mut predictor = PredictionEngine::new();
    predictor.set_display_preference(DisplayPreference::Never);

    predictor.new_user_byte(b'x', &fb, Instant::now());

    let mut shown = fb.clone();
    predictor.cull(&fb, Instant::now());
    predictor.apply(&mut shown);

    assert_eq!(differing_cells(&fb, &shown), 0);
}
