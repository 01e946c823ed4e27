//! Human-like behavior simulation.
//!
//! Shadows every navigation with randomized but plausible interaction:
//! think delays, reading pauses scaled to page length, mouse paths,
//! scrolling, hovering, and per-character typing rhythm. Each DOM
//! interaction failure is caught and logged locally; the sequence skips
//! the failed step and never aborts the page load itself.

use crate::driver::{BrowserDriver, NavigationResponse};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// Selectors probed when hovering interactive elements.
const HOVER_CANDIDATES: &[&str] = &["a", "button", "input", "[role='button']"];

/// Viewport assumed when the driver cannot report one.
const FALLBACK_VIEWPORT: (u32, u32) = (1280, 800);

/// Mouse movement tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MouseConfig {
    /// Movements per page visit (inclusive range).
    pub movements: (u32, u32),
    /// Interpolation steps per movement (inclusive range).
    pub steps: (u32, u32),
    /// Per-step positional jitter in pixels.
    pub jitter_px: f64,
    /// Pause between steps in milliseconds (inclusive range).
    pub step_pause_ms: (u64, u64),
}

impl Default for MouseConfig {
    fn default() -> Self {
        Self {
            movements: (2, 6),
            steps: (5, 8),
            jitter_px: 2.0,
            step_pause_ms: (10, 40),
        }
    }
}

/// Scroll behavior tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrollConfig {
    /// Chance of scrolling at all after a page load.
    pub probability: f64,
    /// Scroll events per visit (inclusive range).
    pub events: (u32, u32),
    /// Scroll distance per event in pixels (inclusive range).
    pub amount_px: (u32, u32),
    /// Chance a given scroll goes downward.
    pub down_bias: f64,
    /// Pause between scroll events in milliseconds (inclusive range).
    pub pause_ms: (u64, u64),
}

impl Default for ScrollConfig {
    fn default() -> Self {
        Self {
            probability: 0.7,
            events: (1, 4),
            amount_px: (100, 600),
            down_bias: 0.8,
            pause_ms: (300, 1200),
        }
    }
}

/// Hover behavior tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HoverConfig {
    /// Chance of hovering anything after a page load.
    pub probability: f64,
    /// Maximum interactive elements hovered per visit.
    pub max_elements: usize,
    /// Pause after each hover in milliseconds (inclusive range).
    pub pause_ms: (u64, u64),
}

impl Default for HoverConfig {
    fn default() -> Self {
        Self {
            probability: 0.3,
            max_elements: 3,
            pause_ms: (200, 800),
        }
    }
}

/// Typing rhythm tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    /// Delay before each character in milliseconds (inclusive range).
    pub char_delay_ms: (u64, u64),
    /// Delay multiplier after whitespace or punctuation.
    pub pause_multiplier: f64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            char_delay_ms: (30, 120),
            pause_multiplier: 2.0,
        }
    }
}

/// Reading-time estimation tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadingConfig {
    pub words_per_minute: f64,
    pub chars_per_word: f64,
    /// Scale applied to the raw estimate; below 1.0 models skimming.
    pub comprehension: f64,
    /// Clamp on the scaled estimate, in seconds.
    pub min_secs: f64,
    pub max_secs: f64,
    /// Fraction of the estimate actually slept (inclusive range).
    pub fraction: (f64, f64),
}

impl Default for ReadingConfig {
    fn default() -> Self {
        Self {
            words_per_minute: 200.0,
            chars_per_word: 5.0,
            comprehension: 0.75,
            min_secs: 2.0,
            max_secs: 15.0,
            fraction: (0.4, 0.8),
        }
    }
}

/// Nested behavior configuration, mutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Pre-navigation think delay in milliseconds (inclusive range).
    pub think_delay_ms: (u64, u64),
    /// Post-load settle delay in milliseconds (inclusive range).
    pub post_load_delay_ms: (u64, u64),
    pub mouse: MouseConfig,
    pub scroll: ScrollConfig,
    pub hover: HoverConfig,
    pub typing: TypingConfig,
    pub reading: ReadingConfig,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            think_delay_ms: (500, 2000),
            post_load_delay_ms: (500, 1500),
            mouse: MouseConfig::default(),
            scroll: ScrollConfig::default(),
            hover: HoverConfig::default(),
            typing: TypingConfig::default(),
            reading: ReadingConfig::default(),
        }
    }
}

/// Executes plausible interaction sequences against a live page.
pub struct BehaviorSimulator {
    config: Mutex<BehaviorConfig>,
    rng: Mutex<StdRng>,
}

impl BehaviorSimulator {
    pub fn new(config: BehaviorConfig, rng_seed: Option<u64>) -> Self {
        let rng = match rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config: Mutex::new(config),
            rng: Mutex::new(rng),
        }
    }

    /// Snapshot of the current configuration.
    pub fn config(&self) -> BehaviorConfig {
        self.config.lock().unwrap().clone()
    }

    /// Replace the configuration at runtime.
    pub fn set_config(&self, config: BehaviorConfig) {
        *self.config.lock().unwrap() = config;
    }

    /// Navigate with the full interaction sequence wrapped around it.
    ///
    /// Only the navigation itself can fail the caller; every simulated
    /// step degrades by being skipped.
    pub async fn simulate_page_load(
        &self,
        driver: &dyn BrowserDriver,
        url: &str,
        timeout_ms: u64,
    ) -> anyhow::Result<NavigationResponse> {
        let config = self.config();

        let think = self.with_rng(|rng| {
            clamped_normal(
                rng,
                config.think_delay_ms.0 as f64,
                config.think_delay_ms.1 as f64,
            )
        });
        tokio::time::sleep(Duration::from_millis(think as u64)).await;

        let response = driver.navigate(url, timeout_ms).await?;

        let settle = self.with_rng(|rng| sample(rng, config.post_load_delay_ms));
        tokio::time::sleep(Duration::from_millis(settle)).await;

        self.reading_pause(driver, &config).await;
        self.mouse_movements(driver, &config).await;
        self.maybe_scroll(driver, &config).await;
        self.maybe_hover(driver, &config).await;

        Ok(response)
    }

    /// Type text with a human rhythm into the first matching element.
    pub async fn simulate_type(
        &self,
        driver: &dyn BrowserDriver,
        selector: &str,
        text: &str,
    ) -> anyhow::Result<()> {
        driver.focus(selector).await?;
        let config = self.config();

        let mut prev: Option<char> = None;
        for c in text.chars() {
            let delay = self.with_rng(|rng| char_delay(rng, &config.typing, prev));
            tokio::time::sleep(delay).await;
            if let Err(e) = driver.type_char(c).await {
                debug!("typing character failed: {e}");
            }
            prev = Some(c);
        }
        Ok(())
    }

    /// Click the first matching element, approaching it with the mouse.
    pub async fn simulate_click(
        &self,
        driver: &dyn BrowserDriver,
        selector: &str,
    ) -> anyhow::Result<()> {
        let config = self.config();
        let think = self.with_rng(|rng| {
            clamped_normal(
                rng,
                config.think_delay_ms.0 as f64,
                config.think_delay_ms.1 as f64,
            )
        });
        tokio::time::sleep(Duration::from_millis(think as u64)).await;

        match driver.element_center(selector).await {
            Ok((x, y)) => {
                let viewport = driver.viewport().await.unwrap_or(FALLBACK_VIEWPORT);
                self.mouse_path_to(driver, &config, viewport, (x, y)).await;
            }
            Err(e) => debug!("element center lookup failed for {selector}: {e}"),
        }

        driver.click(selector).await
    }

    /// Sleep a fraction of the estimated reading time for the page.
    async fn reading_pause(&self, driver: &dyn BrowserDriver, config: &BehaviorConfig) {
        let chars = match driver.visible_text_len().await {
            Ok(chars) => chars,
            Err(e) => {
                debug!("visible text probe failed: {e}");
                return;
            }
        };
        let estimate = reading_time_secs(chars, &config.reading);
        let fraction = self.with_rng(|rng| {
            rng.gen_range(config.reading.fraction.0..=config.reading.fraction.1)
        });
        tokio::time::sleep(Duration::from_secs_f64(estimate * fraction)).await;
    }

    /// Wander the mouse across the viewport.
    async fn mouse_movements(&self, driver: &dyn BrowserDriver, config: &BehaviorConfig) {
        let viewport = driver.viewport().await.unwrap_or(FALLBACK_VIEWPORT);
        let (movements, mut position) = self.with_rng(|rng| {
            let movements = sample_u32(rng, config.mouse.movements);
            let position = (
                rng.gen_range(0.0..viewport.0 as f64),
                rng.gen_range(0.0..viewport.1 as f64),
            );
            (movements, position)
        });

        for _ in 0..movements {
            let target = self.with_rng(|rng| {
                (
                    rng.gen_range(0.0..viewport.0 as f64),
                    rng.gen_range(0.0..viewport.1 as f64),
                )
            });
            self.mouse_segment(driver, config, viewport, position, target)
                .await;
            position = target;
        }
    }

    /// Move toward a target along an interpolated, jittered path.
    async fn mouse_path_to(
        &self,
        driver: &dyn BrowserDriver,
        config: &BehaviorConfig,
        viewport: (u32, u32),
        target: (f64, f64),
    ) {
        let start = self.with_rng(|rng| {
            (
                rng.gen_range(0.0..viewport.0 as f64),
                rng.gen_range(0.0..viewport.1 as f64),
            )
        });
        self.mouse_segment(driver, config, viewport, start, target)
            .await;
    }

    async fn mouse_segment(
        &self,
        driver: &dyn BrowserDriver,
        config: &BehaviorConfig,
        viewport: (u32, u32),
        from: (f64, f64),
        to: (f64, f64),
    ) {
        let (steps, jitters, pauses) = self.with_rng(|rng| {
            let steps = sample_u32(rng, config.mouse.steps);
            let jitters: Vec<(f64, f64)> = (0..steps)
                .map(|_| {
                    (
                        rng.gen_range(-config.mouse.jitter_px..=config.mouse.jitter_px),
                        rng.gen_range(-config.mouse.jitter_px..=config.mouse.jitter_px),
                    )
                })
                .collect();
            let pauses: Vec<u64> = (0..steps)
                .map(|_| sample(rng, config.mouse.step_pause_ms))
                .collect();
            (steps, jitters, pauses)
        });

        for i in 0..steps {
            let t = (i + 1) as f64 / steps as f64;
            let (jx, jy) = jitters[i as usize];
            let x = (from.0 + (to.0 - from.0) * t + jx).clamp(0.0, viewport.0 as f64);
            let y = (from.1 + (to.1 - from.1) * t + jy).clamp(0.0, viewport.1 as f64);
            if let Err(e) = driver.move_mouse(x, y).await {
                debug!("mouse move failed: {e}");
                return;
            }
            tokio::time::sleep(Duration::from_millis(pauses[i as usize])).await;
        }
    }

    /// Probabilistic scroll burst, mostly downward.
    async fn maybe_scroll(&self, driver: &dyn BrowserDriver, config: &BehaviorConfig) {
        let plan = self.with_rng(|rng| {
            if rng.gen_range(0.0..1.0) >= config.scroll.probability {
                return None;
            }
            let events = sample_u32(rng, config.scroll.events);
            let deltas: Vec<(f64, u64)> = (0..events)
                .map(|_| {
                    let amount = sample_u32(rng, config.scroll.amount_px) as f64;
                    let down = rng.gen_range(0.0..1.0) < config.scroll.down_bias;
                    let pause = sample(rng, config.scroll.pause_ms);
                    (if down { amount } else { -amount }, pause)
                })
                .collect();
            Some(deltas)
        });

        let Some(deltas) = plan else {
            return;
        };
        for (dy, pause) in deltas {
            if let Err(e) = driver.scroll_by(0.0, dy).await {
                debug!("scroll failed: {e}");
                return;
            }
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
    }

    /// Probabilistically hover a few interactive elements.
    async fn maybe_hover(&self, driver: &dyn BrowserDriver, config: &BehaviorConfig) {
        let plan = self.with_rng(|rng| {
            if rng.gen_range(0.0..1.0) >= config.hover.probability {
                return None;
            }
            let mut candidates: Vec<&'static str> = HOVER_CANDIDATES.to_vec();
            for i in (1..candidates.len()).rev() {
                candidates.swap(i, rng.gen_range(0..=i));
            }
            candidates.truncate(config.hover.max_elements);
            let pauses: Vec<u64> = candidates
                .iter()
                .map(|_| sample(rng, config.hover.pause_ms))
                .collect();
            Some((candidates, pauses))
        });

        let Some((candidates, pauses)) = plan else {
            return;
        };
        for (selector, pause) in candidates.into_iter().zip(pauses) {
            if let Err(e) = driver.hover(selector).await {
                debug!("hover failed for {selector}: {e}");
                continue;
            }
            tokio::time::sleep(Duration::from_millis(pause)).await;
        }
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut StdRng) -> R) -> R {
        let mut rng = self.rng.lock().unwrap();
        f(&mut rng)
    }
}

/// Draw from an inclusive millisecond range.
fn sample(rng: &mut StdRng, range: (u64, u64)) -> u64 {
    rng.gen_range(range.0..=range.1.max(range.0))
}

fn sample_u32(rng: &mut StdRng, range: (u32, u32)) -> u32 {
    rng.gen_range(range.0..=range.1.max(range.0))
}

/// Per-character typing delay, doubled after whitespace/punctuation.
fn char_delay(rng: &mut StdRng, config: &TypingConfig, prev: Option<char>) -> Duration {
    let mut ms = sample(rng, config.char_delay_ms) as f64;
    if let Some(prev) = prev {
        if prev.is_whitespace() || prev.is_ascii_punctuation() {
            ms *= config.pause_multiplier;
        }
    }
    Duration::from_millis(ms as u64)
}

/// Normal draw via Box–Muller, clamped to `[min, max]`.
///
/// mean = (min+max)/2, sd = (max-min)/6, so nearly all mass falls inside
/// the range before clamping.
fn clamped_normal(rng: &mut StdRng, min: f64, max: f64) -> f64 {
    let mean = (min + max) / 2.0;
    let sd = (max - min) / 6.0;
    let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
    let u2: f64 = rng.gen_range(0.0..1.0);
    let z = (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos();
    (mean + z * sd).clamp(min, max)
}

/// Estimated seconds a human would spend reading `chars` of visible
/// text, clamped to the configured bounds.
fn reading_time_secs(chars: usize, config: &ReadingConfig) -> f64 {
    let words = chars as f64 / config.chars_per_word;
    let raw = words / config.words_per_minute * 60.0;
    (raw * config.comprehension).clamp(config.min_secs, config.max_secs)
}
