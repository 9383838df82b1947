//! Administrative commands the core understands.
//!
//! The console that parses operator input is a separate concern; this is
//! the command surface it drives, plus the pause-done signalling the
//! scheduler raises back through `CoreEvent::PauseDone`.

use log::info;

use crate::errors::Error;
use crate::pool::{Bouncer, PauseMode, Shutdown};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Finish in-flight queries, drop pooled servers, keep clients.
    Pause,
    /// Pause a single database's pools.
    PauseDb(String),
    /// Quiesce all I/O for an online restart.
    Suspend,
    /// Leave pause or suspend mode.
    Resume,
    /// Resume a single database.
    ResumeDb(String),
    /// Drain servers, then stop the event loop.
    Shutdown,
}

impl Bouncer {
    pub fn admin_command(&mut self, cmd: Command, now: u64) -> Result<(), Error> {
        match cmd {
            Command::Pause => {
                if self.pause_mode != PauseMode::None {
                    return Err(Error::Admin("already paused/suspended".into()));
                }
                info!("PAUSE command issued");
                self.set_pause_mode(PauseMode::Pause, now);
            }
            Command::Suspend => {
                if self.pause_mode != PauseMode::None {
                    return Err(Error::Admin("already paused/suspended".into()));
                }
                info!("SUSPEND command issued");
                self.set_pause_mode(PauseMode::Suspend, now);
            }
            Command::Resume => {
                if self.pause_mode == PauseMode::None {
                    return Err(Error::Admin("pooler is not paused/suspended".into()));
                }
                info!("RESUME command issued");
                self.resume_all();
                self.set_pause_mode(PauseMode::None, now);
            }
            Command::PauseDb(name) => {
                let Some(db_id) = self.find_database_id(&name) else {
                    return Err(Error::Admin(format!("no such database: {name}")));
                };
                info!("PAUSE {name} command issued");
                if let Some(db) = self.databases.get_mut(db_id) {
                    db.db_paused = true;
                }
            }
            Command::ResumeDb(name) => {
                let Some(db_id) = self.find_database_id(&name) else {
                    return Err(Error::Admin(format!("no such database: {name}")));
                };
                info!("RESUME {name} command issued");
                if let Some(db) = self.databases.get_mut(db_id) {
                    db.db_paused = false;
                }
            }
            Command::Shutdown => {
                // Graceful: enter pause mode and let the janitor notice
                // once the last server connection is gone.
                info!("SHUTDOWN command issued");
                self.shutdown = Shutdown::Requested;
                self.set_pause_mode(PauseMode::Pause, now);
            }
        }
        Ok(())
    }
}
