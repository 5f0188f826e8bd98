use anyhow::{anyhow, Result};
use rodio::source::{SineWave, Source};
use rodio::{OutputStream, Sink};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use crate::signals::SoundPlayer;

enum AudioCommand {
    Chime,
}

/// Session-completion chime, synthesized so no sound assets ship with the
/// binary. A dedicated thread owns the non-Send rodio output handles; the
/// player itself only hands commands across a channel.
pub struct ChimePlayer {
    tx: Mutex<Option<Sender<AudioCommand>>>,
}

impl Default for ChimePlayer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChimePlayer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tx: Mutex::new(None),
        }
    }

    fn ensure_thread(&self) -> Result<Sender<AudioCommand>> {
        let mut guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(tx) = guard.as_ref() {
            return Ok(tx.clone());
        }

        let (tx, rx) = mpsc::channel::<AudioCommand>();

        thread::Builder::new()
            .name("fika-audio".to_string())
            .spawn(move || {
                while let Ok(AudioCommand::Chime) = rx.recv() {
                    if let Err(e) = play_chime() {
                        log::warn!("Audio playback failed: {e}");
                    }
                }
            })?;

        *guard = Some(tx.clone());
        Ok(tx)
    }
}

impl SoundPlayer for ChimePlayer {
    fn play_completion(&self) -> Result<()> {
        self.ensure_thread()?
            .send(AudioCommand::Chime)
            .map_err(|_| anyhow!("audio thread is gone"))
    }
}

fn play_chime() -> Result<()> {
    let (_stream, handle) = OutputStream::try_default()?;
    let sink = Sink::try_new(&handle)?;

    // Two rising tones, a short "ding-ding"
    for &freq in &[880.0_f32, 1318.5] {
        sink.append(
            SineWave::new(freq)
                .take_duration(Duration::from_millis(180))
                .amplify(0.4),
        );
    }

    sink.sleep_until_end();
    Ok(())
}
