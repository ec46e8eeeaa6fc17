// Copyright (c) Contributors to the SPK project.
// SPDX-License-Identifier: Apache-2.0
// https://github.com/spkenv/spk

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::queue;
use crate::{Error, Result};

#[cfg(test)]
#[path = "./handler_test.rs"]
mod handler_test;

/// Captured at install time; `sysconf` is not guaranteed to be
/// async-signal-safe so the handler must not call it.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

struct HandlerState {
    installs: usize,
    previous: Option<SigAction>,
}

static STATE: Mutex<HandlerState> = Mutex::new(HandlerState {
    installs: 0,
    previous: None,
});

extern "C" fn on_sigbus(_signal: libc::c_int, info: *mut libc::siginfo_t, _ctx: *mut libc::c_void) {
    // SAFETY: the kernel hands SA_SIGINFO handlers a valid siginfo pointer
    let info = unsafe { &*info };
    if info.si_code != libc::BUS_ADRERR {
        // not a paging error on a mapping of ours; put the default
        // disposition back so that re-executing the instruction produces
        // the usual crash instead of looping through this handler
        // SAFETY: sigaction is async-signal-safe, and a zeroed struct with
        // SIG_DFL is a valid disposition
        unsafe {
            let mut dfl: libc::sigaction = std::mem::zeroed();
            dfl.sa_sigaction = libc::SIG_DFL;
            libc::sigaction(libc::SIGBUS, &dfl, std::ptr::null_mut());
        }
        return;
    }

    let page = PAGE_SIZE.load(Ordering::Relaxed);
    // SAFETY: si_addr is valid for SIGBUS with si_code BUS_ADRERR
    let addr = unsafe { info.si_addr() };
    let aligned = (addr as usize) & !(page - 1);

    queue::push(aligned as *mut libc::c_void);

    // Plaster a zeroed anonymous page over the faulting page so the
    // interrupted instruction can be retried right away. Consumers later
    // replace the whole affected mapping, keeping the queue from filling
    // up with one entry per touched page.
    // SAFETY: mmap is async-signal-safe; the target page is the one that
    // just faulted, so it is backed by a mapping this process created
    unsafe {
        libc::mmap(
            aligned as *mut libc::c_void,
            page,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        );
    }
}

/// Install the process-wide `SIGBUS` handler.
///
/// Installation is reference counted; pair every call with a matching
/// [`reset`]. Only the first call changes the signal disposition.
pub fn install() -> Result<()> {
    let mut state = STATE.lock().expect("sigbus handler state is never poisoned");
    if state.installs == 0 {
        // SAFETY: sysconf has no preconditions
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        PAGE_SIZE.store(page as usize, Ordering::Relaxed);

        let action = SigAction::new(
            SigHandler::SigAction(on_sigbus),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        // SAFETY: the handler performs only async-signal-safe operations
        let previous = unsafe { sigaction(Signal::SIGBUS, &action) }?;
        state.previous = Some(previous);
    }
    state.installs += 1;
    Ok(())
}

/// Undo one [`install`]. The last reset restores the previous `SIGBUS`
/// disposition and empties the fault queue.
pub fn reset() -> Result<()> {
    let mut state = STATE.lock().expect("sigbus handler state is never poisoned");
    if state.installs == 0 {
        return Err(Error::NotInstalled);
    }
    state.installs -= 1;
    if state.installs == 0 {
        if let Some(previous) = state.previous.take() {
            // SAFETY: restoring a disposition previously returned by sigaction
            unsafe { sigaction(Signal::SIGBUS, &previous) }?;
        }
        queue::clear();
    }
    Ok(())
}
