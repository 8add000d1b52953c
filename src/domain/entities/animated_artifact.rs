//! Multi-frame artifact with its own budgeted frame cache.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use super::artifact::DecodedImage;
use super::options::LifecycleEvent;
use crate::domain::ports::{Editor, FrameSource, MemoryProbe, apply_edit};

/// Delay before the budget is recomputed after a memory warning.
const BUDGET_RECOVERY_DELAY: Duration = Duration::from_secs(2);

/// Identifies one display surface showing an animated artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ViewerId(Uuid);

impl ViewerId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ViewerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order in which an over-budget preload pass drops frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionOrder {
    /// Start two frames behind the start index and walk backwards, so the
    /// frames about to be played are dropped last.
    #[default]
    TrailingPlayback,
    /// Start two frames behind the start index and walk forwards.
    Forward,
}

impl EvictionOrder {
    /// Frame index visited at `step` of an eviction walk.
    #[must_use]
    pub const fn index(self, start: usize, step: usize, count: usize) -> usize {
        match self {
            Self::TrailingPlayback => (start + 2 * count - step - 2) % count,
            Self::Forward => (start + 2 * count + step - 2) % count,
        }
    }
}

#[derive(Debug, Clone)]
struct Frame {
    image: Option<Arc<DecodedImage>>,
    size: Option<(u32, u32)>,
    duration: Duration,
}

struct FrameState {
    frames: Vec<Frame>,
    editor: Option<Arc<dyn Editor>>,
    max_cache_size: u64,
    auto_budget: bool,
    current_cache_size: u64,
    cached_frame_count: usize,
    preloading: bool,
}

impl FrameState {
    fn set_image(&mut self, index: usize, image: Arc<DecodedImage>) {
        let frame = &mut self.frames[index];
        frame.size = Some((image.width(), image.height()));
        frame.image = Some(image);
    }
}

/// A decoded multi-frame image.
///
/// Frame 0 is decoded when the artifact is created. Other frames are decoded
/// on demand or by a background preload pass, and kept while their total size
/// fits the cache budget. The budget is either pinned by the caller or derived
/// from system memory.
pub struct AnimatedArtifact {
    source: Box<dyn FrameSource>,
    frame_count: usize,
    loop_count: u32,
    poster: Arc<DecodedImage>,
    state: Mutex<FrameState>,
    sentinel: AtomicU64,
    viewers: Mutex<HashSet<ViewerId>>,
    probe: Arc<dyn MemoryProbe>,
    eviction: EvictionOrder,
}

impl AnimatedArtifact {
    /// Opens an artifact over `source`.
    ///
    /// Returns None if the source has no frames, the first frame cannot be
    /// decoded, or any frame lacks a duration.
    #[must_use]
    pub fn new(source: Box<dyn FrameSource>, probe: Arc<dyn MemoryProbe>) -> Option<Self> {
        let frame_count = source.frame_count();
        if frame_count == 0 {
            return None;
        }
        let poster = Arc::new(source.frame(0, true)?);

        let mut frames = Vec::with_capacity(frame_count);
        for index in 0..frame_count {
            frames.push(Frame {
                image: (index == 0).then(|| Arc::clone(&poster)),
                size: source.frame_size(index),
                duration: source.duration(index)?,
            });
        }

        let max_cache_size = auto_budget(probe.as_ref());
        let state = FrameState {
            frames,
            editor: None,
            max_cache_size,
            auto_budget: true,
            current_cache_size: poster.byte_cost(),
            cached_frame_count: 1,
            preloading: false,
        };

        Some(Self {
            loop_count: source.loop_count(),
            source,
            frame_count,
            poster,
            state: Mutex::new(state),
            sentinel: AtomicU64::new(0),
            viewers: Mutex::new(HashSet::new()),
            probe,
            eviction: EvictionOrder::default(),
        })
    }

    /// Sets the order in which over-budget frames are dropped.
    #[must_use]
    pub fn with_eviction_order(mut self, eviction: EvictionOrder) -> Self {
        self.eviction = eviction;
        self
    }

    /// First frame, decoded at creation.
    #[must_use]
    pub fn poster(&self) -> &Arc<DecodedImage> {
        &self.poster
    }

    /// Number of frames.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    /// Number of times the animation repeats; 0 repeats forever.
    #[must_use]
    pub fn loop_count(&self) -> u32 {
        self.loop_count
    }

    /// The encoded payload this artifact was opened from.
    #[must_use]
    pub fn original_data(&self) -> &Bytes {
        self.source.data()
    }

    /// Bytes currently held by cached frames.
    #[must_use]
    pub fn current_cache_size(&self) -> u64 {
        self.state.lock().current_cache_size
    }

    /// Number of cached frames that reflect the current editor.
    #[must_use]
    pub fn cached_frame_count(&self) -> usize {
        self.state.lock().cached_frame_count
    }

    /// Current frame cache budget in bytes.
    #[must_use]
    pub fn max_cache_size(&self) -> u64 {
        self.state.lock().max_cache_size
    }

    /// Returns true while a background preload pass is running.
    #[must_use]
    pub fn is_preloading(&self) -> bool {
        self.state.lock().preloading
    }

    /// Editor applied to frames.
    #[must_use]
    pub fn editor(&self) -> Option<Arc<dyn Editor>> {
        self.state.lock().editor.clone()
    }

    /// Replaces the editor. Switching to an editor with a different key
    /// marks every cached frame as stale so the next preload re-derives it.
    pub fn set_editor(&self, editor: Option<Arc<dyn Editor>>) {
        let mut state = self.state.lock();
        let current = state.editor.as_ref().map(|e| e.key());
        let next = editor.as_ref().map(|e| e.key());
        if current != next {
            state.editor = editor;
            state.cached_frame_count = 0;
        }
    }

    /// Pins the budget to `size` bytes, or returns to the memory-derived
    /// budget when `size` is None.
    pub fn set_max_cache_size(&self, size: Option<u64>) {
        let mut state = self.state.lock();
        match size {
            Some(size) => {
                state.auto_budget = false;
                state.max_cache_size = size;
            }
            None => {
                state.auto_budget = true;
                state.max_cache_size = auto_budget(self.probe.as_ref());
            }
        }
    }

    /// Recomputes the memory-derived budget unless the caller pinned one.
    pub fn update_cache_size_if_needed(&self) {
        let mut state = self.state.lock();
        if state.auto_budget {
            state.max_cache_size = auto_budget(self.probe.as_ref());
            trace!(budget = state.max_cache_size, "animated budget updated");
        }
    }

    /// Display duration of frame `index`.
    #[must_use]
    pub fn duration_at(&self, index: usize) -> Option<Duration> {
        self.state.lock().frames.get(index).map(|frame| frame.duration)
    }

    /// Frame dimensions, when known.
    #[must_use]
    pub fn frame_size(&self, index: usize) -> Option<(u32, u32)> {
        self.state.lock().frames.get(index).and_then(|frame| frame.size)
    }

    /// Returns frame `index` as it should be displayed under the current
    /// editor.
    ///
    /// A cached frame is returned directly if it reflects the current editor.
    /// Otherwise, when `decode_if_needed` is set, the frame is re-derived,
    /// preferring an unedited cached frame over decoding the source again.
    /// The result is not stored in the frame cache.
    #[must_use]
    pub fn frame_at(&self, index: usize, decode_if_needed: bool) -> Option<Arc<DecodedImage>> {
        if index >= self.frame_count {
            return None;
        }
        let (cached, editor) = {
            let state = self.state.lock();
            (state.frames[index].image.clone(), state.editor.clone())
        };
        self.resolve_frame(index, cached, editor.as_deref(), decode_if_needed)
    }

    fn resolve_frame(
        &self,
        index: usize,
        cached: Option<Arc<DecodedImage>>,
        editor: Option<&dyn Editor>,
        decode_if_needed: bool,
    ) -> Option<Arc<DecodedImage>> {
        if let Some(current) = cached {
            match editor {
                Some(editor) => {
                    if current.edit_key.as_deref() == Some(editor.key().as_str()) {
                        return Some(current);
                    }
                    if decode_if_needed {
                        if current.edit_key.is_none() {
                            return apply_edit(editor, &current).map(Arc::new);
                        }
                        if let Some(raw) = self.source.frame(index, false) {
                            return apply_edit(editor, &raw).map(Arc::new);
                        }
                    }
                }
                None => {
                    if current.edit_key.is_none() {
                        return Some(current);
                    }
                    if decode_if_needed {
                        return self.source.frame(index, true).map(Arc::new);
                    }
                }
            }
        }
        if !decode_if_needed {
            return None;
        }
        match editor {
            Some(editor) => self
                .source
                .frame(index, false)
                .and_then(|raw| apply_edit(editor, &raw))
                .map(Arc::new),
            None => self.source.frame(index, true).map(Arc::new),
        }
    }

    /// Starts a background pass that fills the frame cache forward from
    /// `start`, wrapping around, until the budget is reached. If the cache
    /// is already over budget the pass drops frames instead.
    ///
    /// At most one pass runs per artifact. Returns false if no pass was
    /// started.
    pub fn preload_from(self: &Arc<Self>, start: usize) -> bool {
        if start >= self.frame_count {
            return false;
        }
        let generation = {
            let mut state = self.state.lock();
            if state.preloading || state.cached_frame_count >= self.frame_count {
                return false;
            }
            state.preloading = true;
            self.sentinel.load(Ordering::SeqCst)
        };

        debug!(start, generation, "animated preload started");
        let weak = Arc::downgrade(self);
        let work = move || run_preload(&weak, start, generation);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                drop(handle.spawn_blocking(work));
            }
            Err(_) => {
                std::thread::spawn(work);
            }
        }
        true
    }

    fn is_current(&self, generation: u64) -> bool {
        self.sentinel.load(Ordering::SeqCst) == generation
    }

    fn finish_preload(&self, generation: u64) {
        let mut state = self.state.lock();
        if self.is_current(generation) {
            state.preloading = false;
        }
    }

    fn evict_for_budget(&self, start: usize, generation: u64) {
        for step in 0..self.frame_count {
            let index = self.eviction.index(start, step, self.frame_count);
            let mut state = self.state.lock();
            if !self.is_current(generation) {
                return;
            }
            if let Some(old) = state.frames[index].image.take() {
                state.cached_frame_count = state.cached_frame_count.saturating_sub(1);
                state.current_cache_size -= old.byte_cost();
                trace!(index, "animated frame evicted");
                if state.current_cache_size <= state.max_cache_size {
                    return;
                }
            }
        }
    }

    /// Stores one preloaded frame. Returns false once the budget is full.
    fn admit_frame(&self, index: usize, image: Arc<DecodedImage>, generation: u64) -> bool {
        let mut state = self.state.lock();
        if !self.is_current(generation) {
            return false;
        }
        let cost = image.byte_cost();
        match state.frames[index].image.clone() {
            Some(old) if old.edit_key == image.edit_key => true,
            Some(old) => {
                let next = state.current_cache_size - old.byte_cost() + cost;
                if next > state.max_cache_size {
                    return false;
                }
                state.set_image(index, image);
                state.cached_frame_count += 1;
                state.current_cache_size = next;
                true
            }
            None => {
                let next = state.current_cache_size + cost;
                if next > state.max_cache_size {
                    return false;
                }
                state.set_image(index, image);
                state.cached_frame_count += 1;
                state.current_cache_size = next;
                true
            }
        }
    }

    /// Decodes every frame now and lifts the budget for this artifact.
    pub fn preload_all(&self) {
        {
            let mut state = self.state.lock();
            state.auto_budget = false;
            state.max_cache_size = u64::MAX;
        }
        for index in 0..self.frame_count {
            let (cached, editor) = {
                let state = self.state.lock();
                (state.frames[index].image.clone(), state.editor.clone())
            };
            if let Some(image) = self.resolve_frame(index, cached, editor.as_deref(), true) {
                self.state.lock().set_image(index, image);
            }
        }

        let mut state = self.state.lock();
        let key = state.editor.as_ref().map(|e| e.key());
        let (count, size) = state
            .frames
            .iter()
            .filter_map(|frame| frame.image.as_ref())
            .filter(|image| image.edit_key == key)
            .fold((0, 0), |(count, size), image| {
                (count + 1, size + image.byte_cost())
            });
        state.cached_frame_count = count;
        state.current_cache_size = state
            .frames
            .iter()
            .filter_map(|frame| frame.image.as_ref())
            .map(|image| image.byte_cost())
            .sum();
        debug!(frames = count, bytes = size, "animated frames fully preloaded");
    }

    /// Stops the running preload pass, if any.
    pub fn cancel_preload(&self) {
        let mut state = self.state.lock();
        if state.preloading {
            self.sentinel.fetch_add(1, Ordering::SeqCst);
            state.preloading = false;
        }
    }

    /// Drops every cached frame.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for frame in &mut state.frames {
            frame.image = None;
        }
        state.cached_frame_count = 0;
        state.current_cache_size = 0;
    }

    /// Records a display surface showing this artifact.
    pub fn register_viewer(&self) -> ViewerId {
        let id = ViewerId::new();
        self.viewers.lock().insert(id);
        id
    }

    /// Removes a display surface. When the last one leaves, the preload pass
    /// is cancelled and the frame cache cleared.
    pub fn unregister_viewer(&self, id: ViewerId) {
        let empty = {
            let mut viewers = self.viewers.lock();
            viewers.remove(&id);
            viewers.is_empty()
        };
        if empty {
            self.cancel_preload();
            self.clear();
        }
    }

    /// Number of registered display surfaces.
    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Applies a lifecycle signal immediately.
    pub fn handle_lifecycle(&self, event: LifecycleEvent) {
        if event.releases_memory() {
            self.cancel_preload();
            self.clear();
        } else {
            self.update_cache_size_if_needed();
        }
    }

    /// Follows lifecycle signals until the sender closes or the artifact is
    /// dropped. After a memory warning the budget is recomputed once the
    /// system has had time to recover.
    pub fn watch_lifecycle(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<LifecycleEvent>,
    ) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(artifact) = weak.upgrade() else {
                    break;
                };
                artifact.handle_lifecycle(event);
                if event == LifecycleEvent::MemoryWarning {
                    let weak = weak.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(BUDGET_RECOVERY_DELAY).await;
                        if let Some(artifact) = weak.upgrade() {
                            artifact.update_cache_size_if_needed();
                        }
                    });
                }
            }
        })
    }
}

impl Drop for AnimatedArtifact {
    fn drop(&mut self) {
        self.sentinel.fetch_add(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for AnimatedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AnimatedArtifact")
            .field("frame_count", &self.frame_count)
            .field("loop_count", &self.loop_count)
            .field("cached_frame_count", &state.cached_frame_count)
            .field("current_cache_size", &state.current_cache_size)
            .field("max_cache_size", &state.max_cache_size)
            .finish_non_exhaustive()
    }
}

fn run_preload(weak: &Weak<AnimatedArtifact>, start: usize, generation: u64) {
    let Some(artifact) = weak.upgrade() else {
        return;
    };
    if !artifact.is_current(generation) {
        return;
    }

    let over_budget = {
        let state = artifact.state.lock();
        state.current_cache_size > state.max_cache_size
    };
    if over_budget {
        artifact.evict_for_budget(start, generation);
        artifact.finish_preload(generation);
        return;
    }

    let count = artifact.frame_count;
    drop(artifact);
    for step in 0..count {
        let Some(artifact) = weak.upgrade() else {
            return;
        };
        let index = (start + step) % count;
        let Some(image) = artifact.frame_at(index, true) else {
            continue;
        };
        if !artifact.is_current(generation) {
            return;
        }
        if !artifact.admit_frame(index, image, generation) {
            break;
        }
    }
    if let Some(artifact) = weak.upgrade() {
        artifact.finish_preload(generation);
        debug!(
            generation,
            cached = artifact.cached_frame_count(),
            "animated preload finished"
        );
    }
}

/// `min(20% of total memory, 60% of free memory)`; unbounded when neither
/// figure is known.
fn auto_budget(probe: &dyn MemoryProbe) -> u64 {
    let total = probe.total_memory().map(|total| total / 5);
    let free = probe.free_memory().map(|free| free / 5 * 3);
    match (total, free) {
        (Some(total), Some(free)) => total.min(free),
        (Some(only), None) | (None, Some(only)) => only,
        (None, None) => u64::MAX,
    }
}
