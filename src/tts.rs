//! tts.rs — Spoken verdict summaries through a local espeak-ng / espeak process.

use std::process::{Child, Command, Stdio};
use tracing::{info, warn};

use crate::feedback::Speaker;

pub fn detect_backend() -> Option<&'static str> {
    let candidates = ["espeak-ng", "espeak"];

    for candidate in candidates {
        let status = Command::new(candidate)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        if let Ok(exit_status) = status {
            if exit_status.success() {
                return Some(candidate);
            }
        }
    }

    None
}

/// BCP-47 tag → espeak voice. Mandarin is `cmn`; other tags keep their
/// primary subtag.
pub fn voice_for_lang(lang: &str) -> String {
    let normalized = lang.trim().replace('_', "-").to_lowercase();
    let primary = normalized.split('-').next().unwrap_or_default();
    match primary {
        "" => "cmn".to_string(),
        "zh" | "cmn" => "cmn".to_string(),
        "yue" => "yue".to_string(),
        other => other.to_string(),
    }
}

/// One utterance at a time: a new summary interrupts the previous one.
pub struct EspeakSpeaker {
    backend: &'static str,
    active: Option<Child>,
}

impl EspeakSpeaker {
    /// `None` when neither espeak-ng nor espeak is installed.
    pub fn detect() -> Option<Self> {
        match detect_backend() {
            Some(backend) => {
                info!("TTS backend available: {}", backend);
                Some(Self { backend, active: None })
            }
            None => {
                warn!("No supported local TTS backend found (expected: espeak-ng or espeak)");
                None
            }
        }
    }

    fn stop_active(&mut self) {
        if let Some(mut child) = self.active.take() {
            let pid = child.id();
            match child.try_wait() {
                Ok(Some(_)) => {}
                Ok(None) => {
                    if let Err(e) = child.kill() {
                        warn!("Failed to kill TTS process {}: {}", pid, e);
                    }
                    let _ = child.wait();
                }
                Err(e) => warn!("Failed to inspect TTS process {}: {}", pid, e),
            }
        }
    }
}

impl Speaker for EspeakSpeaker {
    fn speak(&mut self, text: &str, lang: &str) {
        let prepared = text.trim();
        if prepared.is_empty() {
            return;
        }
        self.stop_active();

        let voice = voice_for_lang(lang);
        match Command::new(self.backend)
            .arg("-v")
            .arg(&voice)
            .arg(prepared)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => {
                info!(
                    "TTS playback via {} (pid={}, voice='{}', text_len={})",
                    self.backend,
                    child.id(),
                    voice,
                    prepared.chars().count()
                );
                self.active = Some(child);
            }
            Err(e) => warn!("Failed to spawn TTS process: {}", e),
        }
    }
}

impl Drop for EspeakSpeaker {
    fn drop(&mut self) {
        self.stop_active();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chinese_tags_map_to_mandarin_voice() {
        assert_eq!(voice_for_lang("zh-CN"), "cmn");
        assert_eq!(voice_for_lang("zh_TW"), "cmn");
        assert_eq!(voice_for_lang(""), "cmn");
    }

    #[test]
    fn other_tags_keep_primary_subtag() {
        assert_eq!(voice_for_lang("pl-PL"), "pl");
        assert_eq!(voice_for_lang("EN-us"), "en");
    }
}
