//! Triple-buffered frame handoff
//!
//! Three preallocated frame slots shuttle decoded video from the decode
//! thread to the render thread without a mutex and without copying. The
//! writer always fills a slot that is neither published ("latest") nor held
//! by the reader, so the reader can hold a frame for as long as it likes
//! while the writer keeps going. There is deliberately no FIFO guarantee;
//! the reader only ever sees the most recently committed frame.

use std::cell::UnsafeCell;
use std::ops::Deref;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const SLOT_COUNT: usize = 3;
const NO_SLOT: u8 = u8::MAX;

/// One decoded video frame, reused in place across its slot's lifetime
#[derive(Debug)]
pub struct VideoFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    id: u32,
}

impl VideoFrame {
    /// Preallocate a frame buffer of `len` bytes
    pub fn new(width: u32, height: u32, len: usize) -> Self {
        Self {
            data: vec![0; len],
            width,
            height,
            id: 0,
        }
    }

    /// Monotonically increasing id stamped by the writer
    pub fn id(&self) -> u32 {
        self.id
    }
}

struct Shared {
    slots: [UnsafeCell<VideoFrame>; SLOT_COUNT],
    writing: AtomicU8,
    reading: AtomicU8,
    latest: AtomicU8,
}

// The slot-selection protocol guarantees the writer and reader never touch
// the same UnsafeCell: the writer only fills a slot that is neither `latest`
// nor `reading`, and the reader only dereferences the slot it published into
// `reading`.
unsafe impl Sync for Shared {}
unsafe impl Send for Shared {}

/// Create a triple buffer from three preallocated frames.
///
/// The writer handle goes to the decode thread, the reader handle to the
/// render thread; single-writer/single-reader is enforced by the split.
pub fn triple_buffer(frames: [VideoFrame; SLOT_COUNT]) -> (FrameWriter, FrameReader) {
    let shared = Arc::new(Shared {
        slots: frames.map(UnsafeCell::new),
        writing: AtomicU8::new(0),
        reading: AtomicU8::new(NO_SLOT),
        latest: AtomicU8::new(NO_SLOT),
    });
    (
        FrameWriter {
            shared: shared.clone(),
        },
        FrameReader { shared },
    )
}

/// Decode-thread side of the triple buffer
pub struct FrameWriter {
    shared: Arc<Shared>,
}

impl FrameWriter {
    /// Borrow a frame slot to fill in place, stamped with `id`.
    ///
    /// Picks the first slot not claimed by the reader and not currently
    /// published, so an in-progress read is never overwritten.
    pub fn slot(&mut self, id: u32) -> &mut VideoFrame {
        let mut index = self.shared.writing.load(Ordering::Relaxed) as usize;
        loop {
            let reading = self.shared.reading.load(Ordering::SeqCst);
            let latest = self.shared.latest.load(Ordering::SeqCst);
            if index != reading as usize && index != latest as usize {
                break;
            }
            index = (index + 1) % SLOT_COUNT;
        }
        self.shared.writing.store(index as u8, Ordering::Relaxed);

        // SAFETY: `index` differs from both `reading` and `latest`, so the
        // reader cannot hold this slot, and this is the only writer.
        let frame = unsafe { &mut *self.shared.slots[index].get() };
        frame.id = id;
        frame
    }

    /// Publish the slot filled by the last [`slot`](Self::slot) call
    pub fn commit(&mut self) {
        let writing = self.shared.writing.load(Ordering::Relaxed);
        self.shared.latest.store(writing, Ordering::SeqCst);
    }
}

/// Render-thread side of the triple buffer
pub struct FrameReader {
    shared: Arc<Shared>,
}

impl FrameReader {
    /// Snapshot the most recently committed frame, or None before the first
    /// commit. The slot stays pinned until the returned handle drops.
    pub fn latest(&mut self) -> Option<FrameRef<'_>> {
        // Publish the claim, then confirm `latest` did not move between the
        // load and the store; a commit in that window could have freed the
        // slot for the writer before the claim landed.
        let mut latest = self.shared.latest.load(Ordering::SeqCst);
        loop {
            self.shared.reading.store(latest, Ordering::SeqCst);
            let confirm = self.shared.latest.load(Ordering::SeqCst);
            if confirm == latest {
                break;
            }
            latest = confirm;
        }
        if latest == NO_SLOT {
            return None;
        }

        // SAFETY: publishing `latest` into `reading` keeps the writer out of
        // this slot for the lifetime of the handle.
        let frame = unsafe { &*self.shared.slots[latest as usize].get() };
        Some(FrameRef {
            reader: self,
            frame,
        })
    }

    /// Forget any published frames and restart slot selection, e.g. after a
    /// reconnect. Only bookkeeping is touched; frame allocations survive.
    pub fn reset(&mut self) {
        self.shared.reading.store(NO_SLOT, Ordering::SeqCst);
        self.shared.latest.store(NO_SLOT, Ordering::SeqCst);
    }
}

/// Borrowed view of the latest committed frame; releases its slot on drop
pub struct FrameRef<'a> {
    reader: &'a mut FrameReader,
    frame: &'a VideoFrame,
}

impl Deref for FrameRef<'_> {
    type Target = VideoFrame;

    fn deref(&self) -> &VideoFrame {
        self.frame
    }
}

impl Drop for FrameRef<'_> {
    fn drop(&mut self) {
        self.reader.shared.reading.store(NO_SLOT, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    fn frames() -> [VideoFrame; 3] {
        [
            VideoFrame::new(4, 4, 16),
            VideoFrame::new(4, 4, 16),
            VideoFrame::new(4, 4, 16),
        ]
    }

    #[test]
    fn empty_until_first_commit() {
        let (mut writer, mut reader) = triple_buffer(frames());
        assert!(reader.latest().is_none());

        writer.slot(1).data[0] = 0xAB;
        assert!(reader.latest().is_none());

        writer.commit();
        let frame = reader.latest().unwrap();
        assert_eq!(frame.id(), 1);
        assert_eq!(frame.data[0], 0xAB);
    }

    #[test]
    fn reader_pins_slot_against_writer() {
        let (mut writer, mut reader) = triple_buffer(frames());
        writer.slot(1).data[0] = 1;
        writer.commit();

        let held = reader.latest().unwrap();
        assert_eq!(held.data[0], 1);

        // Two more frames land while the reader holds frame 1; neither may
        // reuse the held slot.
        writer.slot(2).data[0] = 2;
        writer.commit();
        writer.slot(3).data[0] = 3;
        writer.commit();

        assert_eq!(held.id(), 1);
        assert_eq!(held.data[0], 1);
        drop(held);

        let next = reader.latest().unwrap();
        assert_eq!(next.id(), 3);
    }

    #[test]
    fn reset_clears_published_frame() {
        let (mut writer, mut reader) = triple_buffer(frames());
        writer.slot(9);
        writer.commit();
        assert!(reader.latest().is_some());
        reader.reset();
        assert!(reader.latest().is_none());
    }

    #[test]
    fn concurrent_writer_and_reader() {
        let (mut writer, mut reader) = triple_buffer(frames());
        let done = Arc::new(AtomicBool::new(false));

        let writer_done = done.clone();
        let producer = thread::spawn(move || {
            for id in 1..=5000u32 {
                let frame = writer.slot(id);
                // Stamp the whole buffer with the id so torn content is
                // detectable on the reader side.
                frame.data.fill(id as u8);
                writer.commit();
            }
            writer_done.store(true, Ordering::Release);
        });

        let mut last_id = 0u32;
        while !done.load(Ordering::Acquire) || last_id < 5000 {
            if let Some(frame) = reader.latest() {
                // Ids never go backwards
                assert!(frame.id() >= last_id, "id regressed: {} -> {}", last_id, frame.id());
                // Frame content is consistent with its id while held
                let stamp = frame.id() as u8;
                assert!(frame.data.iter().all(|b| *b == stamp));
                last_id = frame.id();
            }
            if done.load(Ordering::Acquire) && last_id >= 1 {
                break;
            }
        }

        producer.join().unwrap();
    }
}
