//! Registry of open files and directories.
//!
//! The kernel keeps one 64-bit value per open file for us. Instead of
//! storing raw descriptors or client pointers in it, every backend keeps
//! its open objects in a [`HandleTable`] and hands the kernel an id.

use super::backend::FsResult;
use libc::EBADF;
use parking_lot::Mutex;

/// An open object of one backend.
#[derive(Debug, Clone)]
pub enum Handle<F, D> {
    /// An open regular file
    File(F),
    /// An open directory stream
    Dir(D),
}

#[derive(Debug)]
struct Slot<H> {
    generation: u32,
    value: Option<H>,
}

#[derive(Debug)]
struct Arena<H> {
    slots: Vec<Slot<H>>,
    free: Vec<usize>,
    live: usize,
}

/// Arena of open handles addressed by generation-tagged ids.
///
/// Id layout: `generation << 32 | (slot + 1)`. Id 0 is never issued.
#[derive(Debug)]
pub struct HandleTable<H> {
    arena: Mutex<Arena<H>>,
}

fn split(id: u64) -> Option<(u32, usize)> {
    let slot = (id & 0xffff_ffff) as usize;
    if slot == 0 {
        return None;
    }
    Some(((id >> 32) as u32, slot - 1))
}

impl<H> HandleTable<H> {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self {
            arena: Mutex::new(Arena {
                slots: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
        }
    }

    /// Stores `value` and returns its id.
    pub fn insert(&self, value: H) -> u64 {
        let mut arena = self.arena.lock();
        arena.live += 1;
        let index = match arena.free.pop() {
            Some(index) => {
                arena.slots[index].value = Some(value);
                index
            }
            None => {
                arena.slots.push(Slot {
                    generation: 0,
                    value: Some(value),
                });
                arena.slots.len() - 1
            }
        };
        let generation = arena.slots[index].generation;
        (u64::from(generation) << 32) | (index as u64 + 1)
    }

    /// Runs `f` with exclusive access to the handle behind `id`.
    pub fn with<R>(&self, id: u64, f: impl FnOnce(&mut H) -> FsResult<R>) -> FsResult<R> {
        let (generation, index) = split(id).ok_or(EBADF)?;
        let mut arena = self.arena.lock();
        match arena.slots.get_mut(index) {
            Some(slot) if slot.generation == generation => match slot.value.as_mut() {
                Some(value) => f(value),
                None => Err(EBADF),
            },
            _ => Err(EBADF),
        }
    }

    /// Removes the handle behind `id`; the id is dead afterwards.
    pub fn remove(&self, id: u64) -> FsResult<H> {
        let (generation, index) = split(id).ok_or(EBADF)?;
        let mut arena = self.arena.lock();
        let slot = match arena.slots.get_mut(index) {
            Some(slot) if slot.generation == generation => slot,
            _ => return Err(EBADF),
        };
        let value = slot.value.take().ok_or(EBADF)?;
        slot.generation = slot.generation.wrapping_add(1);
        arena.free.push(index);
        arena.live -= 1;
        Ok(value)
    }

    /// Number of open handles.
    pub fn len(&self) -> usize {
        self.arena.lock().live
    }

    /// Whether no handle is open.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every open handle.
    pub fn drain(&self) -> Vec<H> {
        let mut arena = self.arena.lock();
        let mut drained = Vec::with_capacity(arena.live);
        let Arena { slots, free, live } = &mut *arena;
        for (index, slot) in slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                free.push(index);
                drained.push(value);
            }
        }
        *live = 0;
        drained
    }
}

impl<F, D> HandleTable<Handle<F, D>> {
    /// Runs `f` on the open file behind `id`.
    pub fn with_file<R>(&self, id: u64, f: impl FnOnce(&mut F) -> FsResult<R>) -> FsResult<R> {
        self.with(id, |handle| match handle {
            Handle::File(file) => f(file),
            Handle::Dir(_) => Err(EBADF),
        })
    }

    /// Runs `f` on the open directory behind `id`.
    pub fn with_dir<R>(&self, id: u64, f: impl FnOnce(&mut D) -> FsResult<R>) -> FsResult<R> {
        self.with(id, |handle| match handle {
            Handle::Dir(dir) => f(dir),
            Handle::File(_) => Err(EBADF),
        })
    }

    /// Removes the open file behind `id`.
    pub fn remove_file(&self, id: u64) -> FsResult<F> {
        self.with(id, |handle| match handle {
            Handle::File(_) => Ok(()),
            Handle::Dir(_) => Err(EBADF),
        })?;
        match self.remove(id)? {
            Handle::File(file) => Ok(file),
            Handle::Dir(_) => Err(EBADF),
        }
    }

    /// Removes the open directory behind `id`.
    pub fn remove_dir(&self, id: u64) -> FsResult<D> {
        self.with(id, |handle| match handle {
            Handle::Dir(_) => Ok(()),
            Handle::File(_) => Err(EBADF),
        })?;
        match self.remove(id)? {
            Handle::Dir(dir) => Ok(dir),
            Handle::File(_) => Err(EBADF),
        }
    }
}

impl<F: Clone, D: Clone> HandleTable<Handle<F, D>> {
    /// A clone of the open file behind `id`.
    ///
    /// The table lock is released before the caller uses it, so backends
    /// keeping shared values here can run I/O on several handles at once.
    pub fn file(&self, id: u64) -> FsResult<F> {
        self.with_file(id, |file| Ok(file.clone()))
    }

    /// A clone of the open directory behind `id`.
    pub fn dir(&self, id: u64) -> FsResult<D> {
        self.with_dir(id, |dir| Ok(dir.clone()))
    }
}

impl<H> Default for HandleTable<H> {
    fn default() -> Self {
        Self::new()
    }
}
