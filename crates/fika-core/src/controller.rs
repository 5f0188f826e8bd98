use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use fika_storage::{
    Database, SessionKind, SiteTable, SiteUsage, TimerState, TimerStatus, UserSettings,
};

use crate::domain;
use crate::error::CommandError;
use crate::signals::{BlockReason, PageSink, SoundPlayer};

/// Text sent with the single-minute warning.
pub const ONE_MINUTE_WARNING: &str = "1 minute left";

/// The Session & Budget Controller.
///
/// Sole writer of the timer record and the site usage table. Every operation
/// reads the latest persisted state, computes, and writes back; serialization
/// across triggers is the daemon loop's job, so each method here can stay a
/// plain synchronous read-compute-write.
pub struct Controller {
    db: Database,
    page: Arc<dyn PageSink>,
    sound: Arc<dyn SoundPlayer>,
}

impl Controller {
    pub fn new(db: Database, page: Arc<dyn PageSink>, sound: Arc<dyn SoundPlayer>) -> Self {
        Self { db, page, sound }
    }

    /// Start a session. A missing or zero duration resolves from settings by
    /// kind; a missing kind defaults to focus. The cycle count carries over
    /// from the prior record unconditionally.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read or write fails.
    pub fn start_timer(
        &self,
        duration: Option<u32>,
        kind: Option<SessionKind>,
        now: DateTime<Utc>,
    ) -> Result<TimerState> {
        let kind = kind.unwrap_or(SessionKind::Focus);
        let duration = match duration {
            Some(minutes) if minutes > 0 => minutes,
            _ => self.resolve_duration(kind)?,
        };

        let prior = self.db.get_timer_state()?;
        let end = now + Duration::minutes(i64::from(duration));
        let state = TimerState::running(kind, end, duration, prior.pomodoros_completed);
        self.db.put_timer_state(&state)?;

        log::info!("Timer started: {} for {duration}m", kind.label());
        Ok(state)
    }

    /// Stop the current session and return to the idle default. The cycle
    /// count does not survive a manual stop.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn stop_timer(&self) -> Result<TimerState> {
        let state = TimerState::idle();
        self.db.put_timer_state(&state)?;
        log::info!("Timer stopped");
        Ok(state)
    }

    /// Handle the one-shot expiry trigger. The returned state is what the
    /// daemon re-arms its deadline from.
    ///
    /// A stale trigger (expiry delivered while idle, e.g. racing a stop)
    /// must not crash: it resets to the idle default and moves on.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read or write fails.
    pub fn on_expiry(&self, now: DateTime<Utc>) -> Result<TimerState> {
        let current = self.db.get_timer_state()?;
        let settings = self.db.get_settings()?;

        // Sound plays on every expiry; a failed chime never holds up the
        // state transition.
        if settings.sound_enabled {
            if let Err(e) = self.sound.play_completion() {
                log::warn!("Completion sound failed: {e}");
            }
        }

        match current.status.kind() {
            Some(SessionKind::Focus) => {
                let completed = current.pomodoros_completed + 1;

                // Persist the incremented count against the ending session
                // first; start_timer then carries it into the break.
                let mut ending = current;
                ending.pomodoros_completed = completed;
                self.db.put_timer_state(&ending)?;

                let next = if completed % 4 == 0 {
                    SessionKind::LongBreak
                } else {
                    SessionKind::ShortBreak
                };
                log::info!(
                    "Focus complete, starting {} (cycles: {completed})",
                    next.label()
                );
                self.start_timer(None, Some(next), now)
            }
            Some(_) => {
                if settings.auto_start_focus {
                    log::info!("Break complete, auto-starting focus");
                    self.start_timer(None, Some(SessionKind::Focus), now)
                } else {
                    log::info!("Break complete, waiting for user");
                    let mut state = TimerState::idle();
                    state.pomodoros_completed = current.pomodoros_completed;
                    self.db.put_timer_state(&state)?;
                    Ok(state)
                }
            }
            None => {
                log::warn!("Expiry fired with no active session, resetting");
                let state = TimerState::idle();
                self.db.put_timer_state(&state)?;
                Ok(state)
            }
        }
    }

    /// Per-tick budget tracking for the currently active page.
    ///
    /// Untracked domains and unparsable URLs are skipped silently. While a
    /// focus session is running, tracked domains are blocked without being
    /// charged; otherwise one tick charges one minute and the remaining
    /// budget decides between a block, a one-minute warning, or silence.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read or write fails.
    pub fn track_active_page(&self, url: &str) -> Result<()> {
        let Some(tracked) = domain::tracked_domain(url) else {
            log::debug!("Active page has no usable domain, skipping tick");
            return Ok(());
        };

        let mut sites = self.db.get_sites()?;
        let Some(usage) = sites.get_mut(&tracked) else {
            return Ok(());
        };

        let timer = self.db.get_timer_state()?;
        if timer.status == TimerStatus::Focus {
            // Focus mode is the master override: block, charge nothing.
            log::info!("Blocking {tracked} (focus mode active)");
            self.page.block(&tracked, BlockReason::FocusMode);
            return Ok(());
        }

        usage.minutes_used_today += 1;
        let remaining = usage.remaining_minutes();
        log::info!(
            "Tracking {tracked}: {}/{}m",
            usage.minutes_used_today,
            usage.daily_limit_minutes
        );
        self.db.put_sites(&sites)?;

        if remaining <= 0 {
            self.page.block(&tracked, BlockReason::DailyLimit);
        } else if remaining == 1 {
            self.page.warn(&tracked, ONE_MINUTE_WARNING);
        }

        Ok(())
    }

    /// Zero every budget whose recorded reset date is not `today`. Idempotent
    /// and cheap to run on every tick; persists only when something changed.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read or write fails.
    pub fn reset_expired_budgets(&self, today: &str) -> Result<()> {
        let mut sites = self.db.get_sites()?;
        let mut changed = false;

        for (tracked, usage) in &mut sites {
            if usage.last_reset_date != today {
                log::info!("Resetting daily budget for {tracked}");
                usage.minutes_used_today = 0;
                usage.last_reset_date = today.to_string();
                changed = true;
            }
        }

        if changed {
            self.db.put_sites(&sites)?;
        }
        Ok(())
    }

    /// Start tracking a domain. Duplicate domains are ignored without any
    /// state change; a non-positive limit is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError`] for invalid input, or an error if a store
    /// read or write fails.
    pub fn add_site(
        &self,
        raw_domain: &str,
        daily_limit_minutes: i64,
        today: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let limit = validate_limit(daily_limit_minutes)?;
        let tracked = domain::normalize_domain(raw_domain)
            .ok_or_else(|| CommandError::InvalidDomain(raw_domain.to_string()))?;

        let mut sites = self.db.get_sites()?;
        if sites.contains_key(&tracked) {
            log::debug!("{tracked} is already tracked, ignoring");
            return Ok(());
        }

        sites.insert(tracked.clone(), SiteUsage::new(limit, today, now));
        self.db.put_sites(&sites)?;
        log::info!("Tracking {tracked} with a {limit}m daily limit");
        Ok(())
    }

    /// Replace the daily limit for an already-tracked domain. Absent domains
    /// and invalid values are ignored, not errors.
    ///
    /// # Errors
    ///
    /// Returns an error if a store read or write fails.
    pub fn set_site_limit(&self, raw_domain: &str, daily_limit_minutes: i64) -> Result<()> {
        let Ok(limit) = validate_limit(daily_limit_minutes) else {
            return Ok(());
        };
        let Some(tracked) = domain::normalize_domain(raw_domain) else {
            return Ok(());
        };

        let mut sites = self.db.get_sites()?;
        if let Some(usage) = sites.get_mut(&tracked) {
            usage.daily_limit_minutes = limit;
            self.db.put_sites(&sites)?;
            log::info!("Updated {tracked} daily limit to {limit}m");
        }
        Ok(())
    }

    /// Full replace of the settings record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store write fails.
    pub fn update_settings(&self, settings: &UserSettings) -> Result<()> {
        self.db.put_settings(settings)?;
        log::info!("Settings updated");
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn timer_state(&self) -> Result<TimerState> {
        self.db.get_timer_state()
    }

    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn settings(&self) -> Result<UserSettings> {
        self.db.get_settings()
    }

    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub fn sites(&self) -> Result<SiteTable> {
        self.db.get_sites()
    }

    fn resolve_duration(&self, kind: SessionKind) -> Result<u32> {
        let settings = self.db.get_settings()?;
        let minutes = match kind {
            SessionKind::Focus => settings.focus_duration,
            SessionKind::ShortBreak => settings.short_break_duration,
            SessionKind::LongBreak => settings.long_break_duration,
        };
        Ok(if minutes > 0 { minutes } else { 25 })
    }
}

fn validate_limit(daily_limit_minutes: i64) -> Result<u32, CommandError> {
    if daily_limit_minutes <= 0 {
        return Err(CommandError::InvalidLimit);
    }
    u32::try_from(daily_limit_minutes).map_err(|_| CommandError::InvalidLimit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signals::PageSignal;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<(String, PageSignal)>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<(String, PageSignal)> {
            self.events.lock().unwrap().clone()
        }
    }

    impl PageSink for RecordingSink {
        fn block(&self, domain: &str, reason: BlockReason) {
            self.events
                .lock()
                .unwrap()
                .push((domain.to_string(), PageSignal::BlockSite { reason }));
        }

        fn warn(&self, domain: &str, text: &str) {
            self.events.lock().unwrap().push((
                domain.to_string(),
                PageSignal::Warning {
                    text: text.to_string(),
                },
            ));
        }
    }

    #[derive(Default)]
    struct CountingSound {
        plays: Mutex<u32>,
        fail: bool,
    }

    impl CountingSound {
        fn failing() -> Self {
            Self {
                plays: Mutex::new(0),
                fail: true,
            }
        }

        fn plays(&self) -> u32 {
            *self.plays.lock().unwrap()
        }
    }

    impl SoundPlayer for CountingSound {
        fn play_completion(&self) -> Result<()> {
            *self.plays.lock().unwrap() += 1;
            if self.fail {
                anyhow::bail!("no audio device");
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        controller: Controller,
        page: Arc<RecordingSink>,
        sound: Arc<CountingSound>,
    }

    fn fixture() -> Fixture {
        fixture_with_sound(CountingSound::default())
    }

    fn fixture_with_sound(sound: CountingSound) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(Some(dir.path().join("fika.db"))).unwrap();
        db.ensure_defaults().unwrap();
        let page = Arc::new(RecordingSink::default());
        let sound = Arc::new(sound);
        let controller = Controller::new(db, page.clone(), sound.clone());
        Fixture {
            _dir: dir,
            controller,
            page,
            sound,
        }
    }

    fn at_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 26, 12, 0, 0).unwrap()
    }

    fn db(f: &Fixture) -> &Database {
        &f.controller.db
    }

    #[test]
    fn start_defaults_to_configured_focus_duration() {
        let f = fixture();
        let now = at_noon();

        let state = f.controller.start_timer(None, None, now).unwrap();

        assert_eq!(state.status, TimerStatus::Focus);
        assert_eq!(state.duration_minutes, 25);
        assert_eq!(state.end_timestamp, Some(now + Duration::minutes(25)));
        assert!(state.is_consistent());
    }

    #[test]
    fn start_resolves_duration_per_kind_from_settings() {
        let f = fixture();
        let mut settings = f.controller.settings().unwrap();
        settings.focus_duration = 50;
        settings.short_break_duration = 10;
        f.controller.update_settings(&settings).unwrap();

        let focus = f
            .controller
            .start_timer(None, Some(SessionKind::Focus), at_noon())
            .unwrap();
        assert_eq!(focus.duration_minutes, 50);

        let short = f
            .controller
            .start_timer(None, Some(SessionKind::ShortBreak), at_noon())
            .unwrap();
        assert_eq!(short.duration_minutes, 10);
        assert_eq!(short.status, TimerStatus::ShortBreak);
    }

    #[test]
    fn unset_duration_falls_back_to_25() {
        let f = fixture();
        let mut settings = f.controller.settings().unwrap();
        settings.focus_duration = 0;
        f.controller.update_settings(&settings).unwrap();

        let state = f.controller.start_timer(None, None, at_noon()).unwrap();
        assert_eq!(state.duration_minutes, 25);
    }

    #[test]
    fn explicit_duration_wins_over_settings() {
        let f = fixture();
        let now = at_noon();
        let state = f.controller.start_timer(Some(90), None, now).unwrap();
        assert_eq!(state.duration_minutes, 90);
        assert_eq!(state.end_timestamp, Some(now + Duration::minutes(90)));
    }

    #[test]
    fn stop_resets_to_idle_default_and_clears_cycles() {
        let f = fixture();
        f.controller.start_timer(None, None, at_noon()).unwrap();
        let expired = f.controller.on_expiry(at_noon()).unwrap();
        assert_eq!(expired.pomodoros_completed, 1);

        let stopped = f.controller.stop_timer().unwrap();
        assert_eq!(stopped, TimerState::idle());
        assert_eq!(stopped.pomodoros_completed, 0);
        assert!(stopped.is_consistent());
    }

    #[test]
    fn fourth_completed_focus_selects_long_break() {
        let f = fixture();
        let mut settings = f.controller.settings().unwrap();
        settings.auto_start_focus = true;
        f.controller.update_settings(&settings).unwrap();

        let mut now = at_noon();
        f.controller.start_timer(None, None, now).unwrap();

        for completed in 1..=4_u32 {
            // focus session expires
            now += Duration::minutes(25);
            let after_focus = f.controller.on_expiry(now).unwrap();
            assert_eq!(after_focus.pomodoros_completed, completed);
            if completed % 4 == 0 {
                assert_eq!(after_focus.status, TimerStatus::LongBreak);
            } else {
                assert_eq!(after_focus.status, TimerStatus::ShortBreak);
            }

            // break expires, auto-start brings focus back
            now += Duration::minutes(30);
            let after_break = f.controller.on_expiry(now).unwrap();
            assert_eq!(after_break.status, TimerStatus::Focus);
            assert_eq!(after_break.pomodoros_completed, completed);
        }
    }

    #[test]
    fn break_expiry_without_auto_start_goes_idle_but_keeps_cycles() {
        let f = fixture();
        let now = at_noon();
        f.controller.start_timer(None, None, now).unwrap();
        f.controller.on_expiry(now + Duration::minutes(25)).unwrap();

        let state = f.controller.on_expiry(now + Duration::minutes(30)).unwrap();
        assert_eq!(state.status, TimerStatus::Idle);
        assert_eq!(state.end_timestamp, None);
        assert_eq!(state.pomodoros_completed, 1);
    }

    #[test]
    fn expiry_while_idle_is_a_defensive_reset() {
        let f = fixture();
        let state = f.controller.on_expiry(at_noon()).unwrap();
        assert_eq!(state, TimerState::idle());
    }

    #[test]
    fn expiry_plays_sound_and_survives_audio_failure() {
        let f = fixture_with_sound(CountingSound::failing());
        f.controller.start_timer(None, None, at_noon()).unwrap();

        let state = f.controller.on_expiry(at_noon()).unwrap();

        assert_eq!(f.sound.plays(), 1);
        assert_eq!(state.status, TimerStatus::ShortBreak);
    }

    #[test]
    fn sound_disabled_skips_the_chime() {
        let f = fixture();
        let mut settings = f.controller.settings().unwrap();
        settings.sound_enabled = false;
        f.controller.update_settings(&settings).unwrap();

        f.controller.start_timer(None, None, at_noon()).unwrap();
        f.controller.on_expiry(at_noon()).unwrap();
        assert_eq!(f.sound.plays(), 0);
    }

    #[test]
    fn tick_charges_one_minute_to_the_tracked_domain() {
        let f = fixture();
        f.controller
            .add_site("reddit.com", 10, "2026-08-26", at_noon())
            .unwrap();

        f.controller
            .track_active_page("https://www.reddit.com/r/rust")
            .unwrap();

        let sites = f.controller.sites().unwrap();
        assert_eq!(sites["reddit.com"].minutes_used_today, 1);
        assert!(f.page.events().is_empty());
    }

    #[test]
    fn reaching_the_limit_emits_a_daily_limit_block() {
        let f = fixture();
        f.controller
            .add_site("reddit.com", 2, "2026-08-26", at_noon())
            .unwrap();

        f.controller
            .track_active_page("https://reddit.com/")
            .unwrap();
        assert_eq!(
            f.page.events(),
            vec![(
                "reddit.com".to_string(),
                PageSignal::Warning {
                    text: ONE_MINUTE_WARNING.to_string()
                }
            )]
        );

        f.controller
            .track_active_page("https://reddit.com/")
            .unwrap();
        assert_eq!(
            f.page.events().last().unwrap().1,
            PageSignal::BlockSite {
                reason: BlockReason::DailyLimit
            }
        );
        assert_eq!(
            f.controller.sites().unwrap()["reddit.com"].minutes_used_today,
            2
        );
    }

    #[test]
    fn usage_past_the_limit_keeps_blocking() {
        let f = fixture();
        f.controller
            .add_site("reddit.com", 1, "2026-08-26", at_noon())
            .unwrap();

        f.controller
            .track_active_page("https://reddit.com/")
            .unwrap();
        f.controller
            .track_active_page("https://reddit.com/")
            .unwrap();

        let events = f.page.events();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(_, signal)| matches!(
            signal,
            PageSignal::BlockSite {
                reason: BlockReason::DailyLimit
            }
        )));
    }

    #[test]
    fn focus_mode_blocks_without_charging() {
        let f = fixture();
        f.controller
            .add_site("reddit.com", 10, "2026-08-26", at_noon())
            .unwrap();
        f.controller.start_timer(None, None, at_noon()).unwrap();

        f.controller
            .track_active_page("https://reddit.com/")
            .unwrap();

        assert_eq!(
            f.page.events(),
            vec![(
                "reddit.com".to_string(),
                PageSignal::BlockSite {
                    reason: BlockReason::FocusMode
                }
            )]
        );
        assert_eq!(
            f.controller.sites().unwrap()["reddit.com"].minutes_used_today,
            0
        );
    }

    #[test]
    fn breaks_do_not_block_tracked_sites() {
        let f = fixture();
        f.controller
            .add_site("reddit.com", 10, "2026-08-26", at_noon())
            .unwrap();
        f.controller
            .start_timer(None, Some(SessionKind::ShortBreak), at_noon())
            .unwrap();

        f.controller
            .track_active_page("https://reddit.com/")
            .unwrap();

        assert!(f.page.events().is_empty());
        assert_eq!(
            f.controller.sites().unwrap()["reddit.com"].minutes_used_today,
            1
        );
    }

    #[test]
    fn untracked_domains_are_never_touched_or_signaled() {
        let f = fixture();
        f.controller.start_timer(None, None, at_noon()).unwrap();

        f.controller
            .track_active_page("https://example.com/")
            .unwrap();

        assert!(f.page.events().is_empty());
        assert!(f.controller.sites().unwrap().is_empty());
    }

    #[test]
    fn malformed_urls_are_skipped_silently() {
        let f = fixture();
        f.controller.track_active_page("not a url").unwrap();
        f.controller.track_active_page("").unwrap();
        assert!(f.page.events().is_empty());
    }

    #[test]
    fn budget_reset_is_idempotent_within_a_day() {
        let f = fixture();
        f.controller
            .add_site("reddit.com", 10, "2026-08-25", at_noon())
            .unwrap();
        f.controller
            .track_active_page("https://reddit.com/")
            .unwrap();

        f.controller.reset_expired_budgets("2026-08-26").unwrap();
        let after_first = f.controller.sites().unwrap();
        assert_eq!(after_first["reddit.com"].minutes_used_today, 0);
        assert_eq!(after_first["reddit.com"].last_reset_date, "2026-08-26");

        f.controller.reset_expired_budgets("2026-08-26").unwrap();
        assert_eq!(f.controller.sites().unwrap(), after_first);
    }

    #[test]
    fn budget_reset_only_touches_stale_records() {
        let f = fixture();
        f.controller
            .add_site("old.com", 10, "2026-08-25", at_noon())
            .unwrap();
        f.controller
            .add_site("fresh.com", 10, "2026-08-26", at_noon())
            .unwrap();
        f.controller.track_active_page("https://old.com/").unwrap();
        f.controller
            .track_active_page("https://fresh.com/")
            .unwrap();

        f.controller.reset_expired_budgets("2026-08-26").unwrap();

        let sites = f.controller.sites().unwrap();
        assert_eq!(sites["old.com"].minutes_used_today, 0);
        assert_eq!(sites["fresh.com"].minutes_used_today, 1);
    }

    #[test]
    fn add_site_rejects_non_positive_limits() {
        let f = fixture();

        let err = f
            .controller
            .add_site("reddit.com", 0, "2026-08-26", at_noon())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandError>(),
            Some(&CommandError::InvalidLimit)
        );

        let err = f
            .controller
            .add_site("reddit.com", -5, "2026-08-26", at_noon())
            .unwrap_err();
        assert_eq!(
            err.downcast_ref::<CommandError>(),
            Some(&CommandError::InvalidLimit)
        );

        assert!(f.controller.sites().unwrap().is_empty());
    }

    #[test]
    fn add_site_ignores_duplicates() {
        let f = fixture();
        f.controller
            .add_site("reddit.com", 10, "2026-08-26", at_noon())
            .unwrap();
        f.controller
            .track_active_page("https://reddit.com/")
            .unwrap();

        // same domain, different spelling; usage must survive untouched
        f.controller
            .add_site("www.Reddit.com", 99, "2026-08-26", at_noon())
            .unwrap();

        let sites = f.controller.sites().unwrap();
        assert_eq!(sites.len(), 1);
        assert_eq!(sites["reddit.com"].daily_limit_minutes, 10);
        assert_eq!(sites["reddit.com"].minutes_used_today, 1);
    }

    #[test]
    fn set_site_limit_ignores_absent_domains_and_bad_values() {
        let f = fixture();
        f.controller
            .add_site("reddit.com", 10, "2026-08-26", at_noon())
            .unwrap();

        f.controller.set_site_limit("absent.com", 20).unwrap();
        f.controller.set_site_limit("reddit.com", 0).unwrap();
        assert_eq!(
            f.controller.sites().unwrap()["reddit.com"].daily_limit_minutes,
            10
        );

        f.controller.set_site_limit("www.reddit.com", 20).unwrap();
        assert_eq!(
            f.controller.sites().unwrap()["reddit.com"].daily_limit_minutes,
            20
        );
    }

    #[test]
    fn idle_iff_no_end_timestamp_across_sequences() {
        let f = fixture();
        let now = at_noon();

        for state in [
            f.controller.start_timer(None, None, now).unwrap(),
            f.controller.on_expiry(now).unwrap(),
            f.controller.stop_timer().unwrap(),
            f.controller.on_expiry(now).unwrap(),
            f.controller
                .start_timer(Some(5), Some(SessionKind::LongBreak), now)
                .unwrap(),
            f.controller.stop_timer().unwrap(),
        ] {
            assert!(state.is_consistent(), "inconsistent record: {state:?}");
        }
    }

    #[test]
    fn first_run_defaults_are_present() {
        let f = fixture();
        assert_eq!(db(&f).get_settings().unwrap(), UserSettings::default());
        assert_eq!(db(&f).get_timer_state().unwrap(), TimerState::idle());
    }
}
