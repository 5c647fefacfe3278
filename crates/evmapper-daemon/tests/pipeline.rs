//! End-to-end pipeline tests
//!
//! Drives the injection pipeline with synthetic events against recording
//! output devices and asserts on the emitted sequences. Time-dependent
//! behavior runs on tokio's paused clock.

use std::sync::Arc;
use std::time::Duration;

use evmapper_config::{
    compile_preset, EventKind, InputCombination, InputConfig, Mapping, Preset, SymbolTable,
    TargetDevice,
};
use evmapper_daemon::injection::context::{Context, SharedVars, VarValue};
use evmapper_daemon::injection::pipeline::{Pipeline, PipelineMsg, SourcedEvent};
use evmapper_daemon::injection::runtime::MacroRuntime;
use evmapper_daemon::outputs::{Event, OutputRegistry};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;

const KEY_A: u16 = 30; // KEY_A
const KEY_B: u16 = 48; // KEY_B
const KEY_LEFTSHIFT: u16 = 42;
const ABS_X: u16 = 0;
const REL_X: u16 = 0;

struct Rig {
    ctx: Arc<Context>,
    runtime: Arc<MacroRuntime>,
    tx: mpsc::UnboundedSender<PipelineMsg>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    origin: Arc<str>,
}

impl Rig {
    fn new(mappings: Vec<Mapping>) -> Self {
        Self::with_shared(mappings, SharedVars::new(), Arc::new(OutputRegistry::recording()))
    }

    fn with_shared(
        mappings: Vec<Mapping>,
        vars: SharedVars,
        outputs: Arc<OutputRegistry>,
    ) -> Self {
        let symbols = Arc::new(SymbolTable::new());
        let preset = Preset {
            name: "test".to_string(),
            group_key: "test group".to_string(),
            mappings,
        };
        let compiled = compile_preset(&preset, &symbols).expect("test preset must be valid");

        let forward = outputs
            .create_forward("test group", evmapper_config::targets::Capabilities::default())
            .expect("recording forward device");
        let ctx = Arc::new(Context::new(
            compiled,
            symbols,
            Arc::clone(&outputs),
            forward,
            vars,
        ));

        let runtime = MacroRuntime::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let pipeline = Pipeline::new(
            Arc::clone(&ctx),
            Arc::clone(&runtime),
            rx,
            tx.clone(),
            cancel_rx,
        );
        let task = tokio::spawn(pipeline.run());

        Self {
            ctx,
            runtime,
            tx,
            cancel: cancel_tx,
            task,
            origin: Arc::from("test-origin"),
        }
    }

    async fn send(&self, kind: EventKind, code: u16, value: i32) {
        let event = SourcedEvent::new(Arc::clone(&self.origin), Event::new(kind, code, value));
        self.tx
            .send(PipelineMsg::Input(event))
            .expect("pipeline alive");
        // let the pipeline task process the message
        sleep(Duration::from_millis(1)).await;
    }

    async fn press(&self, code: u16) {
        self.send(EventKind::Key, code, 1).await;
    }

    async fn release(&self, code: u16) {
        self.send(EventKind::Key, code, 0).await;
    }

    fn recorded(&self, target: TargetDevice) -> Vec<Event> {
        self.ctx.outputs.get(target).recorded()
    }

    fn forwarded(&self) -> Vec<Event> {
        self.ctx.forward.recorded()
    }

    async fn shutdown(self) {
        let _ = self.cancel.send(true);
        self.runtime.shutdown(Duration::from_secs(5)).await;
        let _ = self.task.await;
    }
}

fn key_combination(codes: &[u16]) -> InputCombination {
    InputCombination::new(codes.iter().map(|&code| InputConfig::key(code)).collect())
}

fn abs_config(code: u16, threshold: Option<i32>) -> InputConfig {
    InputConfig {
        kind: EventKind::Abs,
        code,
        origin_hash: None,
        analog_threshold: threshold,
    }
}

// a single key remapped one to one
#[tokio::test(start_paused = true)]
async fn simple_key_remap() {
    let rig = Rig::new(vec![Mapping::key_to_key(
        key_combination(&[KEY_A]),
        TargetDevice::Keyboard,
        KEY_B,
    )]);

    rig.press(KEY_A).await;
    rig.release(KEY_A).await;

    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![Event::key(KEY_B, 1), Event::key(KEY_B, 0)]
    );
    assert!(rig.forwarded().is_empty());
    rig.shutdown().await;
}

// combination with release_combination_keys
#[tokio::test(start_paused = true)]
async fn combination_with_release_keys() {
    let rig = Rig::new(vec![Mapping::key_to_key(
        key_combination(&[KEY_LEFTSHIFT, KEY_A]),
        TargetDevice::Keyboard,
        KEY_B,
    )]);

    rig.press(KEY_LEFTSHIFT).await;
    assert_eq!(rig.forwarded(), vec![Event::key(KEY_LEFTSHIFT, 1)]);
    assert!(rig.recorded(TargetDevice::Keyboard).is_empty());

    rig.press(KEY_A).await;
    // the held shift is released on the forwarded device before the output
    assert_eq!(
        rig.forwarded(),
        vec![Event::key(KEY_LEFTSHIFT, 1), Event::key(KEY_LEFTSHIFT, 0)]
    );
    assert_eq!(rig.recorded(TargetDevice::Keyboard), vec![Event::key(KEY_B, 1)]);

    rig.release(KEY_A).await;
    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![Event::key(KEY_B, 1), Event::key(KEY_B, 0)]
    );

    // the shift release was already synthesized, nothing more happens
    rig.release(KEY_LEFTSHIFT).await;
    assert_eq!(
        rig.forwarded(),
        vec![Event::key(KEY_LEFTSHIFT, 1), Event::key(KEY_LEFTSHIFT, 0)]
    );
    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![Event::key(KEY_B, 1), Event::key(KEY_B, 0)]
    );
    rig.shutdown().await;
}

// the shorter mapping is released while the
// longer one is active and re-fires afterwards
#[tokio::test(start_paused = true)]
async fn longest_match_resolution() {
    const KEY_X: u16 = 45;
    const KEY_Y: u16 = 21;
    let rig = Rig::new(vec![
        Mapping::key_to_key(key_combination(&[KEY_A]), TargetDevice::Keyboard, KEY_X),
        Mapping::key_to_key(key_combination(&[KEY_A, KEY_B]), TargetDevice::Keyboard, KEY_Y),
    ]);

    rig.press(KEY_A).await;
    assert_eq!(rig.recorded(TargetDevice::Keyboard), vec![Event::key(KEY_X, 1)]);

    rig.press(KEY_B).await;
    // the singleton releases before the longer combination fires
    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![Event::key(KEY_X, 1), Event::key(KEY_X, 0), Event::key(KEY_Y, 1)]
    );

    rig.release(KEY_B).await;
    // the longer combination releases, the still-held singleton re-fires
    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![
            Event::key(KEY_X, 1),
            Event::key(KEY_X, 0),
            Event::key(KEY_Y, 1),
            Event::key(KEY_Y, 0),
            Event::key(KEY_X, 1),
        ]
    );

    rig.release(KEY_A).await;
    let events = rig.recorded(TargetDevice::Keyboard);
    assert_eq!(events.last(), Some(&Event::key(KEY_X, 0)));

    // balanced edges for both outputs
    for code in [KEY_X, KEY_Y] {
        let presses = events.iter().filter(|e| e.code == code && e.value == 1).count();
        let releases = events.iter().filter(|e| e.code == code && e.value == 0).count();
        assert_eq!(presses, releases, "unbalanced edges for {code}");
    }
    rig.shutdown().await;
}

// macro branching on tap vs hold
#[tokio::test(start_paused = true)]
async fn macro_tap_vs_hold() {
    let mapping = Mapping::with_symbol(
        key_combination(&[KEY_LEFTSHIFT]),
        TargetDevice::Keyboard,
        "if_tap(key(KEY_A), key(KEY_B), 300)",
    );

    let rig = Rig::new(vec![mapping.clone()]);
    rig.press(KEY_LEFTSHIFT).await;
    sleep(Duration::from_millis(100)).await;
    rig.release(KEY_LEFTSHIFT).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![Event::key(KEY_A, 1), Event::key(KEY_A, 0)]
    );
    rig.shutdown().await;

    let rig = Rig::new(vec![mapping]);
    rig.press(KEY_LEFTSHIFT).await;
    sleep(Duration::from_millis(500)).await;
    rig.release(KEY_LEFTSHIFT).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![Event::key(KEY_B, 1), Event::key(KEY_B, 0)]
    );
    rig.shutdown().await;
}

// shared variable across two injections
#[tokio::test(start_paused = true)]
async fn shared_variable_across_devices() {
    const BTN_MIDDLE: u16 = 0x112;
    let vars = SharedVars::new();
    let outputs = Arc::new(OutputRegistry::recording());

    let device_x = Rig::with_shared(
        vec![Mapping::with_symbol(
            key_combination(&[KEY_LEFTSHIFT]),
            TargetDevice::Keyboard,
            "set(foo, 1).hold().set(foo, 0)",
        )],
        vars.clone(),
        Arc::clone(&outputs),
    );
    let device_y = Rig::with_shared(
        vec![Mapping::with_symbol(
            key_combination(&[KEY_A]),
            TargetDevice::KeyboardMouse,
            "if_eq($foo, 1, hold_keys(KEY_A), hold_keys(BTN_MIDDLE))",
        )],
        vars.clone(),
        Arc::clone(&outputs),
    );

    // X held: Y emits KEY_A
    device_x.press(KEY_LEFTSHIFT).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(vars.get("foo"), Some(VarValue::Int(1)));

    device_y.press(KEY_A).await;
    sleep(Duration::from_millis(10)).await;
    device_y.release(KEY_A).await;
    sleep(Duration::from_millis(10)).await;
    let combined = outputs.get(TargetDevice::KeyboardMouse).recorded();
    assert_eq!(combined, vec![Event::key(KEY_A, 1), Event::key(KEY_A, 0)]);

    device_x.release(KEY_LEFTSHIFT).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(vars.get("foo"), Some(VarValue::Int(0)));

    // X released: Y emits BTN_MIDDLE
    device_y.press(KEY_A).await;
    sleep(Duration::from_millis(10)).await;
    device_y.release(KEY_A).await;
    sleep(Duration::from_millis(10)).await;
    let combined = outputs.get(TargetDevice::KeyboardMouse).recorded();
    assert_eq!(
        combined[2..],
        [Event::key(BTN_MIDDLE, 1), Event::key(BTN_MIDDLE, 0)]
    );

    device_x.shutdown().await;
    device_y.shutdown().await;
}

// absolute joystick to relative mouse motion
#[tokio::test(start_paused = true)]
async fn abs_joystick_to_mouse() {
    let mut mapping = Mapping::key_to_key(
        InputCombination::new(vec![abs_config(ABS_X, None)]),
        TargetDevice::Mouse,
        0,
    );
    mapping.output_type = Some(EventKind::Rel);
    mapping.output_code = Some(REL_X);
    mapping.deadzone = 0.1;
    mapping.gain = 1.0;
    mapping.expo = 0.0;
    mapping.rel_rate = 60;

    let rig = Rig::new(vec![mapping]);

    // steady half deflection for one second
    rig.send(EventKind::Abs, ABS_X, 16384).await;
    sleep(Duration::from_secs(1)).await;
    // back inside the deadzone stops the emitter
    rig.send(EventKind::Abs, ABS_X, 0).await;
    sleep(Duration::from_millis(50)).await;

    let events = rig.recorded(TargetDevice::Mouse);
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.kind == EventKind::Rel && e.code == REL_X));
    assert!(events.iter().all(|e| e.value > 0));

    // the deltas sum to the shaped speed over one second:
    // (0.5 - 0.1) / 0.9 * 60 ticks/s ~ 26.7
    let total: i32 = events.iter().map(|e| e.value).sum();
    assert!((24..=29).contains(&total), "total {total}");

    // nothing more after the input returned to the deadzone
    sleep(Duration::from_millis(500)).await;
    let after: i32 = rig.recorded(TargetDevice::Mouse).iter().map(|e| e.value).sum();
    assert_eq!(total, after);
    rig.shutdown().await;
}

// threshold on an analog axis with hysteresis
#[tokio::test(start_paused = true)]
async fn threshold_on_analog_axis() {
    let rig = Rig::new(vec![Mapping::key_to_key(
        InputCombination::new(vec![abs_config(ABS_X, Some(50))]),
        TargetDevice::Keyboard,
        KEY_A,
    )]);

    let percent = |p: i32| (32767.0 * p as f64 / 100.0) as i32;

    rig.send(EventKind::Abs, ABS_X, percent(60)).await;
    assert_eq!(rig.recorded(TargetDevice::Keyboard), vec![Event::key(KEY_A, 1)]);

    // 45% is inside the hysteresis band (above 75% of 50%), no flicker
    rig.send(EventKind::Abs, ABS_X, percent(45)).await;
    assert_eq!(rig.recorded(TargetDevice::Keyboard), vec![Event::key(KEY_A, 1)]);

    rig.send(EventKind::Abs, ABS_X, percent(30)).await;
    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![Event::key(KEY_A, 1), Event::key(KEY_A, 0)]
    );

    // raw axis samples never reach the forwarded device
    assert!(rig.forwarded().is_empty());
    rig.shutdown().await;
}

// relative motion that stops releases the dependent key after the timeout
#[tokio::test(start_paused = true)]
async fn rel_threshold_releases_after_timeout() {
    let mut mapping = Mapping::key_to_key(
        InputCombination::new(vec![InputConfig {
            kind: EventKind::Rel,
            code: REL_X,
            origin_hash: None,
            analog_threshold: Some(10),
        }]),
        TargetDevice::Keyboard,
        KEY_A,
    );
    mapping.release_timeout = 0.05;

    let rig = Rig::new(vec![mapping]);

    rig.send(EventKind::Rel, REL_X, 15).await;
    assert_eq!(rig.recorded(TargetDevice::Keyboard), vec![Event::key(KEY_A, 1)]);

    // no further motion for longer than release_timeout
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        rig.recorded(TargetDevice::Keyboard),
        vec![Event::key(KEY_A, 1), Event::key(KEY_A, 0)]
    );
    rig.shutdown().await;
}

// rel -> abs: accumulated position recenters after release_timeout
#[tokio::test(start_paused = true)]
async fn rel_to_abs_recenters_after_silence() {
    let mut mapping = Mapping::key_to_key(
        InputCombination::new(vec![InputConfig {
            kind: EventKind::Rel,
            code: REL_X,
            origin_hash: None,
            analog_threshold: None,
        }]),
        TargetDevice::Gamepad,
        0,
    );
    mapping.output_type = Some(EventKind::Abs);
    mapping.output_code = Some(ABS_X);
    mapping.deadzone = 0.0;
    mapping.rel_to_abs_input_cutoff = 10.0;
    mapping.release_timeout = 0.05;

    let rig = Rig::new(vec![mapping]);

    rig.send(EventKind::Rel, REL_X, 5).await;
    let events = rig.recorded(TargetDevice::Gamepad);
    assert_eq!(events.len(), 1);
    assert!(events[0].value > 0);

    // saturates at the positive boundary
    for _ in 0..3 {
        rig.send(EventKind::Rel, REL_X, 10).await;
    }
    let events = rig.recorded(TargetDevice::Gamepad);
    assert_eq!(events.last().unwrap().value, 32767);

    // silence recenters the axis
    sleep(Duration::from_millis(100)).await;
    let events = rig.recorded(TargetDevice::Gamepad);
    assert_eq!(events.last().unwrap().value, 0);
    rig.shutdown().await;
}

// abs -> abs shaping end to end
#[tokio::test(start_paused = true)]
async fn abs_to_abs_applies_shaping() {
    let mut mapping = Mapping::key_to_key(
        InputCombination::new(vec![abs_config(ABS_X, None)]),
        TargetDevice::Gamepad,
        0,
    );
    mapping.output_type = Some(EventKind::Abs);
    mapping.output_code = Some(ABS_X);
    mapping.deadzone = 0.1;
    mapping.gain = 1.0;

    let rig = Rig::new(vec![mapping]);

    // inside the deadzone: centered output
    rig.send(EventKind::Abs, ABS_X, 1000).await;
    assert_eq!(rig.recorded(TargetDevice::Gamepad), vec![Event::new(EventKind::Abs, ABS_X, 0)]);

    // full deflection passes through saturated
    rig.send(EventKind::Abs, ABS_X, 32767).await;
    assert_eq!(
        rig.recorded(TargetDevice::Gamepad).last().unwrap().value,
        32767
    );
    rig.shutdown().await;
}

// disabled mappings consume their trigger and emit nothing
#[tokio::test(start_paused = true)]
async fn disabled_mapping_consumes() {
    let rig = Rig::new(vec![Mapping::with_symbol(
        key_combination(&[KEY_A]),
        TargetDevice::Keyboard,
        "disable",
    )]);

    rig.press(KEY_A).await;
    rig.release(KEY_A).await;

    assert!(rig.recorded(TargetDevice::Keyboard).is_empty());
    assert!(rig.forwarded().is_empty());
    rig.shutdown().await;
}

// unmapped events are forwarded in order
#[tokio::test(start_paused = true)]
async fn unmapped_events_are_forwarded() {
    let rig = Rig::new(vec![Mapping::key_to_key(
        key_combination(&[KEY_A]),
        TargetDevice::Keyboard,
        KEY_B,
    )]);

    rig.press(KEY_LEFTSHIFT).await;
    rig.send(EventKind::Syn, 0, 0).await;
    rig.release(KEY_LEFTSHIFT).await;

    assert_eq!(
        rig.forwarded(),
        vec![
            Event::key(KEY_LEFTSHIFT, 1),
            Event::new(EventKind::Syn, 0, 0),
            Event::key(KEY_LEFTSHIFT, 0),
        ]
    );
    rig.shutdown().await;
}

// cancellation drains pressed outputs (balanced edges)
#[tokio::test(start_paused = true)]
async fn stop_releases_pressed_outputs() {
    let rig = Rig::new(vec![Mapping::key_to_key(
        key_combination(&[KEY_A]),
        TargetDevice::Keyboard,
        KEY_B,
    )]);

    rig.press(KEY_A).await;
    assert_eq!(rig.recorded(TargetDevice::Keyboard), vec![Event::key(KEY_B, 1)]);

    let keyboard = rig.ctx.outputs.get(TargetDevice::Keyboard);
    rig.shutdown().await;

    assert_eq!(
        keyboard.recorded(),
        vec![Event::key(KEY_B, 1), Event::key(KEY_B, 0)]
    );
}

// macro press instance outlives a quick tap and still balances its edges
#[tokio::test(start_paused = true)]
async fn macro_mapping_balances_edges_on_stop() {
    let rig = Rig::new(vec![Mapping::with_symbol(
        key_combination(&[KEY_A]),
        TargetDevice::Keyboard,
        "hold_keys(KEY_B)",
    )]);

    rig.press(KEY_A).await;
    sleep(Duration::from_millis(10)).await;
    assert_eq!(rig.recorded(TargetDevice::Keyboard), vec![Event::key(KEY_B, 1)]);

    let keyboard = rig.ctx.outputs.get(TargetDevice::Keyboard);
    rig.shutdown().await;

    let events = keyboard.recorded();
    let presses = events.iter().filter(|e| e.value == 1).count();
    let releases = events.iter().filter(|e| e.value == 0).count();
    assert_eq!(presses, releases);
}
