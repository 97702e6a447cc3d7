//! Voices and the voice pool.
//!
//! The pool is a fixed array of voices allocated up front. Allocation
//! prefers inactive voices and otherwise steals the lowest-priority
//! occupant; every initialisation bumps a monotonic id so stale handles
//! can detect that their voice was taken.

use crate::device::DeviceId;
use crate::limits::VOICES_DEFAULT;
use crate::voice_state::VoiceState;

/// Scheduling priority of a voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VoicePrio {
    Inactive = 0,
    /// Released, still ringing.
    Bg,
    /// Foreground voice of a channel.
    Fg,
    /// Initialised during the current block.
    New,
}

#[derive(Debug)]
pub struct Voice {
    pub id: u64,
    /// Voices triggered by the same note share a group.
    pub group_id: u64,
    pub ch_num: i32,
    pub prio: VoicePrio,
    pub au_index: usize,
    pub proc_index: usize,
    pub proc_device: DeviceId,
    pub state: VoiceState,
}

impl Voice {
    fn new() -> Self {
        Self {
            id: 0,
            group_id: 0,
            ch_num: -1,
            prio: VoicePrio::Inactive,
            au_index: 0,
            proc_index: 0,
            proc_device: 0,
            state: VoiceState::new(),
        }
    }

    pub fn reset(&mut self) {
        self.id = 0;
        self.group_id = 0;
        self.prio = VoicePrio::Inactive;
        self.proc_device = 0;
        self.state.clear();
    }
}

#[derive(Debug)]
pub struct VoicePool {
    voices: Vec<Voice>,
    next_id: u64,
    next_group_id: u64,
}

impl VoicePool {
    pub fn new(size: usize) -> Self {
        Self {
            voices: (0..size.max(1)).map(|_| Voice::new()).collect(),
            next_id: 0,
            next_group_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// A fresh group id for the voices of one note.
    pub fn new_group_id(&mut self) -> u64 {
        self.next_group_id += 1;
        self.next_group_id
    }

    /// Allocate a voice, stealing the lowest-priority occupant if no
    /// inactive voice remains. Returns the voice index.
    pub fn get_voice(&mut self) -> usize {
        let index = self
            .voices
            .iter()
            .position(|v| v.prio == VoicePrio::Inactive)
            .unwrap_or_else(|| {
                // Steal: first occurrence of the lowest priority is the
                // stable choice
                let mut best = 0;
                for (i, voice) in self.voices.iter().enumerate() {
                    if voice.prio < self.voices[best].prio {
                        best = i;
                    }
                }
                best
            });

        let voice = &mut self.voices[index];
        voice.reset();
        self.next_id += 1;
        voice.id = self.next_id;
        voice.prio = VoicePrio::New;
        index
    }

    pub fn voice(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    pub fn voice_mut(&mut self, index: usize) -> Option<&mut Voice> {
        self.voices.get_mut(index)
    }

    /// Borrow a voice only if it still has the expected id.
    pub fn get_checked(&mut self, index: usize, expected_id: u64) -> Option<&mut Voice> {
        self.voices
            .get_mut(index)
            .filter(|v| v.id == expected_id && v.prio != VoicePrio::Inactive)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Voice> {
        self.voices.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Voice> {
        self.voices.iter_mut()
    }

    pub fn active_count(&self) -> usize {
        self.voices
            .iter()
            .filter(|v| v.prio != VoicePrio::Inactive)
            .count()
    }

    /// Group ids with at least one active voice, in ascending order.
    pub fn active_group_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .voices
            .iter()
            .filter(|v| v.prio != VoicePrio::Inactive)
            .map(|v| v.group_id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Voice indices of one group.
    pub fn group_members(&self, group_id: u64) -> Vec<usize> {
        self.voices
            .iter()
            .enumerate()
            .filter(|(_, v)| v.prio != VoicePrio::Inactive && v.group_id == group_id)
            .map(|(i, _)| i)
            .collect()
    }

    /// Deactivate every voice and return them to the free list.
    pub fn reset_all(&mut self) {
        for voice in &mut self.voices {
            voice.reset();
        }
    }
}

impl Default for VoicePool {
    fn default() -> Self {
        Self::new(VOICES_DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_prefers_inactive_voices() {
        let mut pool = VoicePool::new(2);
        let a = pool.get_voice();
        let b = pool.get_voice();
        assert_ne!(a, b);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn stealing_picks_the_lowest_priority() {
        let mut pool = VoicePool::new(2);
        let a = pool.get_voice();
        let b = pool.get_voice();
        pool.voice_mut(a).unwrap().prio = VoicePrio::Bg;
        pool.voice_mut(b).unwrap().prio = VoicePrio::Fg;

        let stolen = pool.get_voice();
        assert_eq!(stolen, a);
        assert_eq!(pool.voice(stolen).unwrap().prio, VoicePrio::New);
    }

    #[test]
    fn ids_are_monotonic_and_detect_eviction() {
        let mut pool = VoicePool::new(1);
        let index = pool.get_voice();
        let old_id = pool.voice(index).unwrap().id;
        pool.voice_mut(index).unwrap().prio = VoicePrio::Bg;

        let again = pool.get_voice();
        assert_eq!(again, index);
        let new_id = pool.voice(again).unwrap().id;
        assert!(new_id > old_id);

        // The stale handle no longer resolves
        assert!(pool.get_checked(index, old_id).is_none());
        assert!(pool.get_checked(index, new_id).is_some());
    }

    #[test]
    fn inactive_voices_have_inactive_states() {
        let mut pool = VoicePool::new(4);
        let index = pool.get_voice();
        pool.voice_mut(index).unwrap().state.active = true;
        pool.voice_mut(index).unwrap().reset();
        let voice = pool.voice(index).unwrap();
        assert_eq!(voice.prio, VoicePrio::Inactive);
        assert!(!voice.state.active);
    }

    #[test]
    fn groups_collect_their_members() {
        let mut pool = VoicePool::new(4);
        let group = pool.new_group_id();
        for _ in 0..2 {
            let index = pool.get_voice();
            pool.voice_mut(index).unwrap().group_id = group;
        }
        assert_eq!(pool.group_members(group).len(), 2);
        assert_eq!(pool.active_group_ids(), vec![group]);
    }
}
