//! Dis channels: rendezvous and fixed-capacity buffered queues.
//!
//! A channel's actual synchronization state (mutex, condvars, buffer) can't
//! be expressed as plain bitmap-traced bytes the way records, arrays and
//! strings are, so a channel allocation's payload holds a single opaque
//! pointer to a boxed [`ChannelState`]; the type descriptor carries no
//! pointer bitmap (the GC never walks into the box) and a finalizer that
//! drops it and unwinds any buffered pointer-typed elements still queued.

use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{allocate, Colour, Pointer, TypeDescriptor};

struct ChannelState {
    capacity: usize,
    element_size: usize,
    element_is_pointer: bool,
    buffer: VecDeque<Vec<u8>>,
    closed: bool,
    /// Rendezvous channels (capacity 0) also track a waiting sender's bytes,
    /// handed directly to the matching receiver rather than buffered.
    waiting_sender: Option<Vec<u8>>,
}

struct Channel {
    state: Mutex<ChannelState>,
    not_empty: Condvar,
    not_full: Condvar,
}

fn finalize(payload: *mut u8) {
    unsafe {
        let raw = (payload as *mut *mut Channel).read();
        let boxed = Box::from_raw(raw);
        let state = boxed.state.lock();
        if state.element_is_pointer {
            for elem in &state.buffer {
                let p = (elem.as_ptr() as *const Pointer).read();
                super::dec(p);
            }
            if let Some(elem) = &state.waiting_sender {
                let p = (elem.as_ptr() as *const Pointer).read();
                super::dec(p);
            }
        }
        drop(state);
        drop(boxed);
    }
}

fn type_desc_with_finalizer() -> Arc<TypeDescriptor> {
    Arc::new(TypeDescriptor {
        size_in_bytes: std::mem::size_of::<usize>(),
        pointer_bitmap: Vec::new(),
        finalizer: Some(finalize),
    })
}

/// Allocates a new channel. `capacity` of 0 is a synchronous rendezvous
/// channel; the reference runtime calls `newchan`/`newchanb` with the
/// buffer element count, a distinction preserved here in `capacity`.
pub fn alloc_channel(
    element_size: usize,
    element_is_pointer: bool,
    capacity: usize,
    colour: Colour,
) -> NonNull<u8> {
    let channel = Box::new(Channel {
        state: Mutex::new(ChannelState {
            capacity,
            element_size,
            element_is_pointer,
            buffer: VecDeque::with_capacity(capacity),
            closed: false,
            waiting_sender: None,
        }),
        not_empty: Condvar::new(),
        not_full: Condvar::new(),
    });
    let ptr = allocate(type_desc_with_finalizer(), colour);
    unsafe {
        (ptr.as_ptr() as *mut *mut Channel).write(Box::into_raw(channel));
    }
    ptr
}

unsafe fn channel_of<'a>(ptr: NonNull<u8>) -> &'a Channel {
    let raw = (ptr.as_ptr() as *const *mut Channel).read();
    &*raw
}

/// Sends `bytes` (one element, `element_size` long) on the channel,
/// blocking until a receiver is ready (capacity 0) or a buffer slot frees up.
pub fn send(ptr: NonNull<u8>, bytes: &[u8]) {
    let channel = unsafe { channel_of(ptr) };
    let mut state = channel.state.lock();
    if state.capacity == 0 {
        while state.waiting_sender.is_some() {
            channel.not_full.wait(&mut state);
        }
        state.waiting_sender = Some(bytes.to_vec());
        channel.not_empty.notify_one();
        while state.waiting_sender.is_some() {
            channel.not_full.wait(&mut state);
        }
    } else {
        while state.buffer.len() >= state.capacity {
            channel.not_full.wait(&mut state);
        }
        state.buffer.push_back(bytes.to_vec());
        channel.not_empty.notify_one();
    }
}

/// Receives one element, blocking until data is available.
pub fn receive(ptr: NonNull<u8>) -> Vec<u8> {
    let channel = unsafe { channel_of(ptr) };
    let mut state = channel.state.lock();
    loop {
        if let Some(bytes) = state.buffer.pop_front() {
            channel.not_full.notify_one();
            return bytes;
        }
        if let Some(bytes) = state.waiting_sender.take() {
            channel.not_full.notify_all();
            return bytes;
        }
        channel.not_empty.wait(&mut state);
    }
}

/// Attempts a send without blocking: succeeds (returns `true`) exactly when
/// [`can_send`] would, performing the same transfer as [`send`] in that
/// case. The scheduler retries a blocked sender's `try_send` on later
/// passes rather than parking the OS worker thread on a condvar (§4.F/§4.G;
/// see `DESIGN.md` for why polling replaces the reference completion-
/// callback model here).
pub fn try_send(ptr: NonNull<u8>, bytes: &[u8]) -> bool {
    let channel = unsafe { channel_of(ptr) };
    let mut state = channel.state.lock();
    if state.capacity == 0 {
        if state.waiting_sender.is_some() {
            return false;
        }
        state.waiting_sender = Some(bytes.to_vec());
        channel.not_empty.notify_one();
        true
    } else {
        if state.buffer.len() >= state.capacity {
            return false;
        }
        state.buffer.push_back(bytes.to_vec());
        channel.not_empty.notify_one();
        true
    }
}

/// Attempts a receive without blocking: succeeds exactly when
/// [`can_receive`] would.
pub fn try_receive(ptr: NonNull<u8>) -> Option<Vec<u8>> {
    let channel = unsafe { channel_of(ptr) };
    let mut state = channel.state.lock();
    if let Some(bytes) = state.buffer.pop_front() {
        channel.not_full.notify_one();
        return Some(bytes);
    }
    if let Some(bytes) = state.waiting_sender.take() {
        channel.not_full.notify_all();
        return Some(bytes);
    }
    None
}

/// Non-blocking probe used by `alt`: true if a `receive` would not block.
pub fn can_receive(ptr: NonNull<u8>) -> bool {
    let channel = unsafe { channel_of(ptr) };
    let state = channel.state.lock();
    !state.buffer.is_empty() || state.waiting_sender.is_some()
}

/// Non-blocking probe used by `alt`: true if a `send` would not block.
pub fn can_send(ptr: NonNull<u8>) -> bool {
    let channel = unsafe { channel_of(ptr) };
    let state = channel.state.lock();
    if state.capacity == 0 {
        state.waiting_sender.is_none()
    } else {
        state.buffer.len() < state.capacity
    }
}

/// The byte width of one element, as given at [`alloc_channel`] time.
pub fn element_size(ptr: NonNull<u8>) -> usize {
    unsafe { channel_of(ptr).state.lock().element_size }
}

/// Whether one element is itself a heap pointer (so the engine must manage
/// its refcount across the transfer).
pub fn element_is_pointer(ptr: NonNull<u8>) -> bool {
    unsafe { channel_of(ptr).state.lock().element_is_pointer }
}

/// Number of elements currently queued (buffered channels only).
pub fn queued_len(ptr: NonNull<u8>) -> usize {
    let channel = unsafe { channel_of(ptr) };
    channel.state.lock().buffer.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::dec;

    #[test]
    fn buffered_send_then_receive() {
        let ptr = alloc_channel(4, false, 2, Colour::White);
        send(ptr, &1i32.to_ne_bytes());
        send(ptr, &2i32.to_ne_bytes());
        assert_eq!(queued_len(ptr), 2);
        assert_eq!(receive(ptr), 1i32.to_ne_bytes());
        assert_eq!(receive(ptr), 2i32.to_ne_bytes());
        dec(Some(ptr));
    }

    #[test]
    fn rendezvous_handoff_across_threads() {
        let ptr = alloc_channel(4, false, 0, Colour::White);
        let addr = ptr.as_ptr() as usize;
        let sender = std::thread::spawn(move || {
            let p = unsafe { NonNull::new_unchecked(addr as *mut u8) };
            send(p, &42i32.to_ne_bytes());
        });
        let got = receive(ptr);
        sender.join().unwrap();
        assert_eq!(got, 42i32.to_ne_bytes());
        dec(Some(ptr));
    }

    #[test]
    fn try_send_fails_when_buffer_is_full() {
        let ptr = alloc_channel(4, false, 1, Colour::White);
        assert!(try_send(ptr, &1i32.to_ne_bytes()));
        assert!(!try_send(ptr, &2i32.to_ne_bytes()));
        assert_eq!(try_receive(ptr), Some(1i32.to_ne_bytes().to_vec()));
        dec(Some(ptr));
    }

    #[test]
    fn try_receive_returns_none_when_empty() {
        let ptr = alloc_channel(4, false, 1, Colour::White);
        assert_eq!(try_receive(ptr), None);
        dec(Some(ptr));
    }

    #[test]
    fn probes_reflect_readiness() {
        let ptr = alloc_channel(4, false, 1, Colour::White);
        assert!(!can_receive(ptr));
        assert!(can_send(ptr));
        send(ptr, &7i32.to_ne_bytes());
        assert!(can_receive(ptr));
        assert!(!can_send(ptr));
        dec(Some(ptr));
    }
}
