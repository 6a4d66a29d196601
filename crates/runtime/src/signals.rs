//! Process-wide signal disposition, set once at startup
//! (`original_source/bin/lem.c`'s `setsignal(SIGPIPE, SIG_IGN, 0)` plus its
//! `SIGCHLD` fallback). `SIGCHLD` is left at `SIG_DFL` rather than the
//! original's `SA_NOCLDSTOP|SA_NOCLDWAIT` fallback: this runtime always
//! reaps children explicitly via a pool job (`dispatch_io::spawn::wait_blocking`,
//! grounded on `os/core.c`'s `os_waitpid`), which needs the zombie to still
//! be there to collect.
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

pub fn install_default_policy() -> Result<(), nix::errno::Errno> {
    unsafe {
        sigaction(
            Signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )?;
        sigaction(
            Signal::SIGCHLD,
            &SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty()),
        )?;
    }
    Ok(())
}
