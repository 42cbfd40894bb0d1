#![no_main]

use std::cell::RefCell;
use std::rc::Rc;

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use statebind::prelude::*;

#[derive(Arbitrary, Debug)]
enum FuzzOp {
    Push(Vec<u8>),
    Pop,
    Shift,
    Unshift(Vec<u8>),
    Splice { start: u8, delete: u8, items: Vec<u8> },
    Replace { index: u8, items: Vec<u8> },
    RemoveAllOf(u8),
    Write { kind: u8, index: u8, items: Vec<u8> },
    Set(Vec<u8>),
}

fuzz_target!(|input: (Vec<u8>, Vec<FuzzOp>)| {
    let (initial, ops) = input;
    let array = ArrayStateOk::new_ok(initial.clone()).with_setter(Setter::pass_through());
    let replica = Rc::new(RefCell::new(initial));
    let sink = Rc::clone(&replica);
    array.subscribe(
        subscriber(move |value: &StateResult<ArrayDiff<u8>>| {
            if let Ok(diff) = value {
                apply_diff(&mut sink.borrow_mut(), diff);
            }
        }),
        false,
    );

    for op in ops.into_iter().take(256) {
        match op {
            FuzzOp::Push(items) => {
                array.push(items);
            }
            FuzzOp::Pop => {
                array.pop();
            }
            FuzzOp::Shift => {
                array.shift();
            }
            FuzzOp::Unshift(items) => {
                array.unshift(items);
            }
            FuzzOp::Splice { start, delete, items } => {
                array.splice(start.into(), delete.into(), items);
            }
            FuzzOp::Replace { index, items } => {
                array.replace(index.into(), items);
            }
            FuzzOp::RemoveAllOf(value) => {
                array.remove_all_of(&value);
            }
            FuzzOp::Write { kind, index, items } => {
                let index = usize::from(index);
                let write = match kind % 3 {
                    0 => ArrayWrite::Added { index, items },
                    1 => ArrayWrite::Removed {
                        index,
                        count: items.len(),
                    },
                    _ => ArrayWrite::Changed { index, items },
                };
                let _ = array.write_sync(write);
            }
            FuzzOp::Set(items) => array.set_ok(items),
        }
        assert_eq!(*replica.borrow(), array.to_vec());
    }
});
