mod common;

use std::thread::sleep;
use std::time::Duration;

use common::{error_of, eval, runtime_in};
use tempfile::tempdir;

#[test]
fn test_timeout_cleared_in_same_turn_never_runs() {
    let dir = tempdir().unwrap();
    let mut runtime = runtime_in(dir.path());

    eval(
        &mut runtime,
        "globalThis.calls = 0; const id = setTimeout(() => calls++, 0); clearTimeout(id)",
    );
    assert_eq!(runtime.active_timers(), 0);

    runtime.pump_once();
    runtime.pump_once();
    assert_eq!(eval(&mut runtime, "calls"), "0");
    assert_eq!(runtime.pending_tasks(), 0);
}

#[test]
fn test_timeout_fires_once_with_extra_arguments() {
    let dir = tempdir().unwrap();
    let mut runtime = runtime_in(dir.path());

    let id = eval(&mut runtime, "globalThis.calls = []; setTimeout((...args) => calls.push(args.join()), 0, 'a', 2)");
    assert_eq!(id, "1");

    runtime.pump_once();
    runtime.pump_once();
    assert_eq!(eval(&mut runtime, "calls.join('|')"), "a,2");
    assert_eq!(runtime.active_timers(), 0);
}

#[test]
fn test_interval_fires_repeatedly_with_same_arguments() {
    let dir = tempdir().unwrap();
    let mut runtime = runtime_in(dir.path());

    eval(
        &mut runtime,
        "globalThis.calls = []; globalThis.id = setInterval((arg) => calls.push(arg), 10, 'tick')",
    );

    for _ in 0..3 {
        sleep(Duration::from_millis(15));
        runtime.pump_once();
    }

    let fired: usize = eval(&mut runtime, "calls.length").parse().unwrap();
    assert!(fired >= 2, "fired {fired} times");
    assert_eq!(eval(&mut runtime, "calls.every((arg) => arg === 'tick')"), "true");
    assert_eq!(runtime.active_timers(), 1);

    eval(&mut runtime, "clearInterval(id)");
    sleep(Duration::from_millis(15));
    runtime.pump_once();
    assert_eq!(eval(&mut runtime, "calls.length"), fired.to_string());
    assert_eq!(runtime.pending_tasks(), 0);
}

#[test]
fn test_negative_delay_uses_default() {
    let dir = tempdir().unwrap();
    let mut runtime = runtime_in(dir.path());

    eval(&mut runtime, "globalThis.calls = 0; setTimeout(() => calls++, -50)");

    runtime.pump_once();
    assert_eq!(eval(&mut runtime, "calls"), "1");
}

#[test]
fn test_huge_delay_stays_pending() {
    let dir = tempdir().unwrap();
    let mut runtime = runtime_in(dir.path());

    eval(&mut runtime, "globalThis.fired = false; setTimeout(() => fired = true, 1e19); setTimeout(() => fired = true, Number.MAX_VALUE)");

    assert_eq!(runtime.pump_once(), 0);
    assert_eq!(eval(&mut runtime, "fired"), "false");
    assert_eq!(runtime.active_timers(), 2);
}

#[test]
fn test_timer_callback_receives_global_receiver() {
    let dir = tempdir().unwrap();
    let mut runtime = runtime_in(dir.path());

    eval(
        &mut runtime,
        "setTimeout(function () { 'use strict'; globalThis.receiverIsGlobal = this === globalThis })",
    );

    runtime.pump_once();
    assert_eq!(eval(&mut runtime, "receiverIsGlobal"), "true");
}

#[test]
fn test_throwing_timer_does_not_stop_the_pump() {
    let dir = tempdir().unwrap();
    let mut runtime = runtime_in(dir.path());

    eval(
        &mut runtime,
        "globalThis.calls = 0; setTimeout(() => { throw new Error('timer failed') }); setTimeout(() => calls++)",
    );

    assert_eq!(runtime.pump_once(), 2);
    assert_eq!(eval(&mut runtime, "calls"), "1");
}

#[test]
fn test_invalid_timer_arguments_throw() {
    let dir = tempdir().unwrap();
    let mut runtime = runtime_in(dir.path());

    assert_eq!(
        error_of(&mut runtime, "setTimeout('not a function', 10)"),
        "TypeError: Invalid arguments. Usage: setTimeout(callback[, delay])."
    );
    assert_eq!(
        error_of(&mut runtime, "setInterval(() => {}, 'soon')"),
        "TypeError: Invalid arguments. Usage: setInterval(callback[, delay])."
    );
    assert_eq!(
        error_of(&mut runtime, "clearTimeout()"),
        "TypeError: Invalid arguments. Usage: clearTimeout(timerId)."
    );
    assert_eq!(
        error_of(&mut runtime, "clearInterval('1')"),
        "TypeError: Invalid arguments. Usage: clearInterval(timerId)."
    );
    assert_eq!(error_of(&mut runtime, "clearTimeout(undefined); clearTimeout(999)"), "no error");
    assert_eq!(runtime.active_timers(), 0);
}
