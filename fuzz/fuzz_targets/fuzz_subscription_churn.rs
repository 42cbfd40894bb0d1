#![no_main]

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use statebind::prelude::*;

#[derive(Arbitrary, Debug)]
enum FuzzStep {
    Subscribe { slot: u8, immediate: bool },
    Unsubscribe { slot: u8 },
    SetInput { which: bool, value: i16 },
    Advance { ms: u8 },
    Read,
}

const SLOTS: usize = 4;

fuzz_target!(|steps: Vec<FuzzStep>| {
    let exec = ManualExecutor::new();
    let a = SyncState::new(Ok(0i32));
    let b = SyncState::new(Ok(0i32));
    let sum = CollectedState::new(
        exec.scheduler(),
        vec![dyn_read(&a), dyn_read(&b)],
        |values: &[StateResult<i32>]| {
            let mut total = 0i32;
            for value in values {
                total = total.saturating_add(value.clone()?);
            }
            Ok(total)
        },
    );

    let deliveries = Rc::new(Cell::new(0usize));
    let subs: Vec<_> = (0..SLOTS)
        .map(|_| {
            let deliveries = Rc::clone(&deliveries);
            subscriber(move |_: &StateResult<i32>| deliveries.set(deliveries.get() + 1))
        })
        .collect();
    let mut attached = [false; SLOTS];

    for step in steps.into_iter().take(512) {
        match step {
            FuzzStep::Subscribe { slot, immediate } => {
                let slot = usize::from(slot) % SLOTS;
                if !attached[slot] {
                    sum.subscribe(Rc::clone(&subs[slot]), immediate);
                    attached[slot] = true;
                }
            }
            FuzzStep::Unsubscribe { slot } => {
                let slot = usize::from(slot) % SLOTS;
                if attached[slot] {
                    sum.unsubscribe(&subs[slot]);
                    attached[slot] = false;
                }
            }
            FuzzStep::SetInput { which, value } => {
                let target = if which { &a } else { &b };
                target.set_ok(i32::from(value));
            }
            FuzzStep::Advance { ms } => exec.advance(Duration::from_millis(ms.into())),
            FuzzStep::Read => {
                let _ = sum.value();
            }
        }
        let any = attached.iter().any(|a| *a);
        assert_eq!(sum.is_active(), any);
        assert_eq!(a.in_use(), any);
        assert_eq!(sum.subscriber_count(), attached.iter().filter(|a| **a).count());
    }

    exec.run_until_stalled();
    if attached.iter().any(|a| *a) {
        let expected = a.get().and_then(|a| b.get().map(|b| a.saturating_add(b)));
        assert_eq!(sum.try_get(), Some(expected));
    }
});
