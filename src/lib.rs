use wasm_bindgen::prelude::*;
use serde::Serialize;

// --- LOGGING ---
#[cfg(target_arch = "wasm32")]
#[wasm_bindgen]
extern "C" {
    #[wasm_bindgen(js_namespace = console)]
    fn log(s: &str);
}

#[cfg(not(target_arch = "wasm32"))]
fn log(_s: &str) {}
macro_rules! console_log {
    ($($t:tt)*) => (log(&format!($($t)*)))
}


// ── Data model ────────────────────────────────────────────────────────────

// Visually blank padding row; unlikely to collide with program content.
pub const SPACING_GLYPH: &str = "\u{2002}";

// Blocked channels never advance by themselves, so mismatched wait codes
// would loop forever without a cap. Reaching it is the one hard failure.
pub const MAX_SYNC_PASSES: usize = 10_000;

/// Synchronization key of a single program line. `wait_code == 0` is a free
/// line; `tool_code` never affects matching.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SyncKey {
    pub wait_code: i32,
    pub station: Option<i32>,
    pub sub_id: Option<i32>,
    pub tool_code: Option<i32>,
}

impl SyncKey {
    pub fn is_free(&self) -> bool {
        self.wait_code == 0
    }

    // Station-less rendezvous: equal non-zero wait code, and equal P sub-id
    // where one was recorded.
    fn rendezvous_with(&self, other: &SyncKey) -> bool {
        self.wait_code != 0
            && self.wait_code == other.wait_code
            && self.station.is_none()
            && other.station.is_none()
            && self.sub_id == other.sub_id
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Station {
    pub id: i32,
    pub members: [usize; 2],
}

/// Rendezvous topology for one synchronization run: which channel pairs may
/// meet at which station, plus the station-less "global" rendezvous that
/// spans every channel still holding lines.
pub struct StationRegistry {
    stations: Vec<Station>,
}

impl StationRegistry {
    // Pair stations are only defined for the classic 3-channel layout.
    // Other channel counts carry an empty pair table and synchronize
    // through the global rendezvous alone.
    pub fn for_channel_count(count: usize) -> Self {
        let stations = if count == 3 {
            vec![
                Station { id: 12, members: [0, 1] },
                Station { id: 13, members: [0, 2] },
                Station { id: 23, members: [1, 2] },
            ]
        } else {
            Vec::new()
        };
        Self { stations }
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    // Global rendezvous: every non-exhausted head carries the same non-zero
    // station-less wait code. Needs at least two live channels.
    pub fn matches_global(&self, heads: &[Option<SyncKey>]) -> bool {
        let mut lead: Option<SyncKey> = None;
        let mut live = 0usize;
        for key in heads.iter().flatten() {
            live += 1;
            match lead {
                None => {
                    if key.wait_code == 0 || key.station.is_some() {
                        return false;
                    }
                    lead = Some(*key);
                }
                Some(first) => {
                    if !first.rendezvous_with(key) {
                        return false;
                    }
                }
            }
        }
        live >= 2
    }

    // Pair rendezvous: both member heads carry this exact station id with
    // equal non-zero wait codes.
    pub fn matches_station(&self, station: &Station, heads: &[Option<SyncKey>]) -> bool {
        let [a, b] = station.members;
        let (Some(ka), Some(kb)) = (
            heads.get(a).copied().flatten(),
            heads.get(b).copied().flatten(),
        ) else {
            return false;
        };
        ka.wait_code != 0
            && ka.wait_code == kb.wait_code
            && ka.station == Some(station.id)
            && kb.station == Some(station.id)
    }
}

/// Read-only movable head over one channel's line list. The backing program
/// is never mutated; replaying a run only needs a fresh cursor.
pub struct ChannelCursor<'a> {
    channel: usize,
    lines: &'a [String],
    head: usize,
}

impl<'a> ChannelCursor<'a> {
    pub fn new(channel: usize, lines: &'a [String]) -> Self {
        Self { channel, lines, head: 0 }
    }

    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn position(&self) -> usize {
        self.head
    }

    pub fn peek(&self) -> Option<&'a str> {
        self.lines.get(self.head).map(String::as_str)
    }

    pub fn advance(&mut self) -> Option<&'a str> {
        let line = self.peek()?;
        self.head += 1;
        Some(line)
    }

    pub fn is_done(&self) -> bool {
        self.head >= self.lines.len()
    }
}

pub struct SyncOutput {
    /// One row-aligned sequence per channel; all the same length.
    pub channels: Vec<Vec<String>>,
    pub overflow: bool,
    /// Head line each channel was stuck on when the pass cap fired,
    /// captured before the forced flush. All `None` on success.
    pub stalled_heads: Vec<Option<String>>,
}

// ── Line classification ───────────────────────────────────────────────────

// Station wait codes, in match order: each M-code set maps to the fixed
// station id its channels meet at.
const STATION_WAIT_CODES: &[(&[i32], i32)] = &[
    (&[131, 133], 13),
    (&[82, 83, 40, 41], 12),
    (&[171, 172], 23),
];

/// Classify one program line into its synchronization key. Parenthesized
/// comments and `;` trailers are skipped; malformed numeric fields degrade
/// to a free line rather than failing the run.
pub fn classify_line(line: &str) -> SyncKey {
    let bytes = line.as_bytes();
    let mut i = 0usize;
    let mut m_word: Option<i32> = None;
    let mut p_word: Option<i32> = None;
    let mut t_word: Option<i32> = None;

    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if b == b';' {
            break;
        }
        if b == b'(' {
            while i < bytes.len() && bytes[i] != b')' {
                i += 1;
            }
            if i < bytes.len() {
                i += 1;
            }
            continue;
        }

        let c = b.to_ascii_uppercase();
        if c == b'M' || c == b'P' || c == b'T' {
            i += 1;
            let (val, len) = parse_number_bytes(&bytes[i..]);
            if let Some(v) = val {
                let slot = match c {
                    b'M' => &mut m_word,
                    b'P' => &mut p_word,
                    _ => &mut t_word,
                };
                // First occurrence of each word wins.
                if slot.is_none() {
                    *slot = Some(v.round() as i32);
                }
            }
            i += len;
            continue;
        }
        i += 1;
    }

    // M with a P sub-id: wait code in the exclusive (200, 999) window,
    // rendezvous keyed on (wait code, sub-id).
    if let (Some(m), Some(p)) = (m_word, p_word) {
        if m > 200 && m < 999 {
            return SyncKey { wait_code: m, sub_id: Some(p), ..Default::default() };
        }
    }

    if let Some(m) = m_word {
        if (200..=998).contains(&m) {
            return SyncKey { wait_code: m, ..Default::default() };
        }
        for (codes, station) in STATION_WAIT_CODES {
            if codes.contains(&m) {
                return SyncKey {
                    wait_code: m,
                    station: Some(*station),
                    ..Default::default()
                };
            }
        }
        // Any other M word is a plain machine function; the line is free.
        return SyncKey::default();
    }

    // Tool call without an M word: informational only.
    if let Some(t) = t_word {
        if t > 99 && t < 999 {
            return SyncKey { tool_code: Some(t), ..Default::default() };
        }
    }

    SyncKey::default()
}

fn parse_number_bytes(bytes: &[u8]) -> (Option<f64>, usize) {
    if bytes.is_empty() {
        return (None, 0);
    }

    let mut i = 0usize;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    if i >= bytes.len() {
        return (None, i);
    }

    let mut len = i;
    if bytes[len] == b'+' || bytes[len] == b'-' {
        len += 1;
    }

    let mut has_digit = false;
    let mut has_dot = false;
    while len < bytes.len() {
        let b = bytes[len];
        if b.is_ascii_digit() {
            has_digit = true;
            len += 1;
            continue;
        }
        if b == b'.' && !has_dot {
            has_dot = true;
            len += 1;
            continue;
        }
        break;
    }

    if !has_digit || len <= i {
        return (None, i);
    }

    let parsed = std::str::from_utf8(&bytes[i..len]).ok().and_then(|s| s.parse::<f64>().ok());
    (parsed, len)
}

// ── Synchronizer ──────────────────────────────────────────────────────────

/// Row-align the given channel programs. Each pass emits exactly one row per
/// channel: rendezvous partners together, free lines immediately, markers
/// for channels blocked on an unmatched wait code or already exhausted.
pub fn synchronize(
    channels: &[Vec<String>],
    registry: &StationRegistry,
    glyph: &str,
) -> SyncOutput {
    let count = channels.len();
    let mut cursors: Vec<ChannelCursor<'_>> = channels
        .iter()
        .enumerate()
        .map(|(idx, lines)| ChannelCursor::new(idx, lines))
        .collect();
    let mut out: Vec<Vec<String>> = vec![Vec::new(); count];
    let mut stalled_heads: Vec<Option<String>> = vec![None; count];
    let mut overflow = false;
    let mut passes = 0usize;

    while cursors.iter().any(|c| !c.is_done()) {
        passes += 1;
        if passes >= MAX_SYNC_PASSES {
            // Deadlocked wait codes: flush the stuck heads verbatim as a
            // final row so the caller can point at them.
            overflow = true;
            for (idx, cursor) in cursors.iter().enumerate() {
                stalled_heads[idx] = cursor.peek().map(str::to_string);
                out[idx].push(cursor.peek().unwrap_or(glyph).to_string());
            }
            break;
        }

        let heads: Vec<Option<SyncKey>> =
            cursors.iter().map(|c| c.peek().map(classify_line)).collect();
        let mut advance = vec![false; count];

        // Priority 1: global rendezvous across every live channel.
        if registry.matches_global(&heads) {
            for (idx, key) in heads.iter().enumerate() {
                if key.is_some() {
                    advance[idx] = true;
                }
            }
        } else {
            // Priority 2: pair stations, in registry order.
            for station in registry.stations() {
                if registry.matches_station(station, &heads) {
                    advance[station.members[0]] = true;
                    advance[station.members[1]] = true;
                    break;
                }
            }
            // Priority 3: any two live channels sharing a station-less code.
            if !advance.iter().any(|a| *a) {
                'pairs: for a in 0..count {
                    for b in (a + 1)..count {
                        if let (Some(ka), Some(kb)) = (&heads[a], &heads[b]) {
                            if ka.rendezvous_with(kb) {
                                advance[a] = true;
                                advance[b] = true;
                                break 'pairs;
                            }
                        }
                    }
                }
            }
        }

        // Emit the row: matched heads and free heads advance, everything
        // else holds position behind a spacing marker.
        for idx in 0..count {
            let cell = if advance[idx] {
                cursors[idx].advance().unwrap_or(glyph).to_string()
            } else {
                match &heads[idx] {
                    Some(key) if key.is_free() => {
                        cursors[idx].advance().unwrap_or(glyph).to_string()
                    }
                    _ => glyph.to_string(),
                }
            };
            out[idx].push(cell);
        }
    }

    SyncOutput { channels: out, overflow, stalled_heads }
}

// ── Spacing reconciler ────────────────────────────────────────────────────

/// Inverse transform: drop every marker-only line, including leading and
/// trailing ones. Idempotent; blank lines are program content and survive.
pub fn strip_spacing(text: &str, glyph: &str) -> String {
    if glyph.is_empty() {
        return text.to_string();
    }
    let kept: Vec<&str> = text.split('\n').filter(|line| *line != glyph).collect();
    kept.join("\n")
}

// ── Editor facade ─────────────────────────────────────────────────────────

#[derive(Serialize, Clone)]
pub struct ChannelProgram {
    pub id: u32,
    pub text: String,
}

#[derive(Serialize, Clone)]
pub struct StalledHead {
    pub channel: u32,
    pub label: String,
    pub line: String,
}

#[derive(Serialize)]
pub struct SyncViewState {
    pub channels: Vec<ChannelProgram>,
    pub synced: bool,
    pub overflow: bool,
    pub stalled: Vec<StalledHead>,
    pub spacing_glyph: String,
    pub row_count: usize,
}

/// Per-session sync state machine the editor UI drives: holds one program
/// text per channel and flips the whole set between the raw view and the
/// row-aligned view.
#[wasm_bindgen]
pub struct ProgramSync {
    channels: Vec<String>,
    glyph: String,
    synced: bool,
    overflow: bool,
    stalled: Vec<StalledHead>,
}

#[wasm_bindgen]
impl ProgramSync {
    #[wasm_bindgen(constructor)]
    pub fn new() -> Self {
        console_log!("ProgramSync ready, glyph U+2002");
        Self {
            channels: Vec::new(),
            glyph: SPACING_GLYPH.to_string(),
            synced: false,
            overflow: false,
            stalled: Vec::new(),
        }
    }

    pub fn clear(&mut self) {
        self.channels.clear();
        self.synced = false;
        self.overflow = false;
        self.stalled.clear();
    }

    // ── Channel loading ───────────────────────────────────────────────────

    pub fn add_channel(&mut self, code: String) -> usize {
        if self.synced {
            self.sync_off();
        }
        self.channels.push(code);
        self.channels.len() - 1
    }

    pub fn load_channel(&mut self, channel_index: usize, code: String) {
        if self.synced {
            self.sync_off();
        }
        if let Some(chan) = self.channels.get_mut(channel_index) {
            *chan = code;
        }
    }

    pub fn load_channels(&mut self, programs: JsValue) {
        let programs: Vec<String> = serde_wasm_bindgen::from_value(programs).unwrap_or_default();
        if self.synced {
            self.sync_off();
        }
        self.channels = programs;
    }

    pub fn set_spacing_glyph(&mut self, glyph: String) {
        if glyph.is_empty() || glyph.contains('\n') {
            return;
        }
        // Strip under the old glyph first so no marker gets stranded.
        if self.synced {
            self.sync_off();
        }
        self.glyph = glyph;
    }

    // ── Sync toggle ───────────────────────────────────────────────────────

    pub fn toggle_sync(&mut self) -> bool {
        if self.synced {
            self.sync_off();
            false
        } else {
            self.sync_on()
        }
    }

    pub fn sync_on(&mut self) -> bool {
        // Toggle-on always re-syncs from clean text, so a stale synchronized
        // view can never stack markers twice.
        let clean: Vec<String> = self
            .channels
            .iter()
            .map(|text| strip_spacing(text, &self.glyph))
            .collect();
        self.channels = clean;
        self.synced = false;
        self.overflow = false;
        self.stalled.clear();

        if self.channels.len() < 2 {
            return false;
        }

        let programs: Vec<Vec<String>> = self
            .channels
            .iter()
            .map(|text| text.split('\n').map(str::to_string).collect())
            .collect();
        let registry = StationRegistry::for_channel_count(programs.len());
        let run = synchronize(&programs, &registry, &self.glyph);

        if run.overflow {
            // Refuse the synchronized view: keep the pre-toggle text and
            // report each stuck head so the author can find the mismatch.
            self.overflow = true;
            self.stalled = run
                .stalled_heads
                .iter()
                .enumerate()
                .filter_map(|(idx, head)| {
                    head.as_ref().map(|line| StalledHead {
                        channel: idx as u32,
                        label: format!("HEAD{}", idx + 1),
                        line: line.clone(),
                    })
                })
                .collect();
            console_log!(
                "Sync aborted after {} passes: {} channel(s) stuck on unmatched wait codes",
                MAX_SYNC_PASSES,
                self.stalled.len()
            );
            return false;
        }

        self.channels = run.channels.iter().map(|rows| rows.join("\n")).collect();
        self.synced = true;
        true
    }

    pub fn sync_off(&mut self) {
        for text in self.channels.iter_mut() {
            *text = strip_spacing(text, &self.glyph);
        }
        self.synced = false;
        self.overflow = false;
        self.stalled.clear();
    }

    // ── State for the UI ──────────────────────────────────────────────────

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn has_overflow(&self) -> bool {
        self.overflow
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Current view of one channel: row-aligned while synchronized,
    /// the raw program otherwise.
    pub fn channel_text(&self, channel_index: usize) -> String {
        self.channels.get(channel_index).cloned().unwrap_or_default()
    }

    /// Text for the execution/plotting backend: always marker-free,
    /// whichever view is active.
    pub fn raw_text(&self, channel_index: usize) -> String {
        self.channels
            .get(channel_index)
            .map(|text| strip_spacing(text, &self.glyph))
            .unwrap_or_default()
    }

    // Equal across channels while synchronized; feeds scroll binding.
    pub fn row_count(&self) -> usize {
        if !self.synced {
            return 0;
        }
        self.channels
            .first()
            .map(|text| text.split('\n').count())
            .unwrap_or(0)
    }

    /// Deadlock report, one "HEADn: line" entry per stuck channel.
    pub fn stalled_labels(&self) -> String {
        let mut entries: Vec<String> = Vec::with_capacity(self.stalled.len());
        for head in &self.stalled {
            entries.push(format!("{}: {}", head.label, head.line));
        }
        entries.join("\n")
    }

    pub fn get_state(&self) -> JsValue {
        let state = SyncViewState {
            channels: self
                .channels
                .iter()
                .enumerate()
                .map(|(idx, text)| ChannelProgram { id: idx as u32, text: text.clone() })
                .collect(),
            synced: self.synced,
            overflow: self.overflow,
            stalled: self.stalled.clone(),
            spacing_glyph: self.glyph.clone(),
            row_count: self.row_count(),
        };
        serde_wasm_bindgen::to_value(&state).unwrap_or(JsValue::NULL)
    }
}
