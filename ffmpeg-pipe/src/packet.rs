use bytes::Bytes;
use ffmpeg_next::{
    Rational,
    packet::{Mut, Ref},
};

use crate::error::check;

/// Compressed (or raw elementary-stream) media unit tagged with the time
/// base its timestamps are expressed in.
///
/// Cloning shares the underlying reference-counted buffer; call
/// [`Packet::make_writable`] (or [`Packet::data_mut`], which does it for you)
/// before changing the payload in place.
pub struct Packet {
    packet: ffmpeg_next::codec::packet::Packet,
    time_base: Rational,
}

impl Packet {
    /// Copies `data` into a new packet buffer.
    pub fn copy(data: &[u8], time_base: Rational) -> Self {
        Self {
            packet: ffmpeg_next::codec::packet::Packet::copy(data),
            time_base,
        }
    }

    pub fn pts(&self) -> Option<i64> {
        self.packet.pts()
    }

    pub fn set_pts(&mut self, pts: Option<i64>) {
        self.packet.set_pts(pts);
    }

    pub fn dts(&self) -> Option<i64> {
        self.packet.dts()
    }

    pub fn set_dts(&mut self, dts: Option<i64>) {
        self.packet.set_dts(dts);
    }

    pub fn duration(&self) -> i64 {
        self.packet.duration()
    }

    pub fn set_duration(&mut self, duration: i64) {
        self.packet.set_duration(duration);
    }

    pub fn size(&self) -> usize {
        self.packet.size()
    }

    pub fn index(&self) -> usize {
        self.packet.stream()
    }

    pub fn set_index(&mut self, index: usize) {
        self.packet.set_stream(index);
    }

    pub fn is_key(&self) -> bool {
        self.packet.is_key()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn data(&self) -> &[u8] {
        self.packet.data().unwrap_or_default()
    }

    /// Copies the payload out into an owned buffer.
    pub fn to_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(self.data())
    }

    /// Whether this handle is the only owner of its buffer.
    pub fn is_writable(&self) -> bool {
        unsafe {
            let buf = (*self.packet.as_ptr()).buf;
            !buf.is_null() && ffmpeg_next::ffi::av_buffer_is_writable(buf) != 0
        }
    }

    /// Detaches the payload from any other handle sharing it.
    pub fn make_writable(&mut self) -> anyhow::Result<()> {
        let ret = unsafe { ffmpeg_next::ffi::av_packet_make_writable(self.packet.as_mut_ptr()) };
        check(ret, "av_packet_make_writable")?;
        Ok(())
    }

    pub fn data_mut(&mut self) -> anyhow::Result<&mut [u8]> {
        self.make_writable()?;
        Ok(self.packet.data_mut().unwrap_or_default())
    }

    /// Rescales pts, dts and duration into `target` and records the new base.
    pub fn rescale_ts(&mut self, target: Rational) {
        if self.time_base != target {
            self.packet.rescale_ts(self.time_base, target);
            self.time_base = target;
        }
    }

    pub(crate) fn as_inner(&self) -> &ffmpeg_next::codec::packet::Packet {
        &self.packet
    }

    pub(crate) fn as_inner_mut(&mut self) -> &mut ffmpeg_next::codec::packet::Packet {
        &mut self.packet
    }
}

impl From<(ffmpeg_next::codec::packet::Packet, Rational)> for Packet {
    fn from((packet, time_base): (ffmpeg_next::codec::packet::Packet, Rational)) -> Self {
        Self { packet, time_base }
    }
}

impl Clone for Packet {
    fn clone(&self) -> Self {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        let ret =
            unsafe { ffmpeg_next::ffi::av_packet_ref(packet.as_mut_ptr(), self.packet.as_ptr()) };
        if ret < 0 {
            log::warn!("av_packet_ref failed ({}), copying payload", ret);
            let mut copy = ffmpeg_next::codec::packet::Packet::copy(self.data());
            unsafe {
                ffmpeg_next::ffi::av_packet_copy_props(copy.as_mut_ptr(), self.packet.as_ptr());
            }
            packet = copy;
        }
        Self {
            packet,
            time_base: self.time_base,
        }
    }
}

impl std::fmt::Debug for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packet")
            .field("index", &self.index())
            .field("pts", &self.pts())
            .field("dts", &self.dts())
            .field("duration", &self.duration())
            .field("size", &self.size())
            .field("time_base", &self.time_base)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_shares_until_written() -> anyhow::Result<()> {
        let mut original = Packet::copy(&[1, 2, 3, 4], Rational::new(1, 25));
        assert!(original.is_writable());

        let shared = original.clone();
        assert!(!original.is_writable());
        assert_eq!(shared.data(), original.data());

        original.data_mut()?[0] = 9;
        assert!(original.is_writable());
        assert_eq!(original.data(), &[9, 2, 3, 4]);
        assert_eq!(shared.data(), &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_clone_keeps_timestamps_and_time_base() {
        let mut original = Packet::copy(&[7u8; 16], Rational::new(1, 90_000));
        original.set_pts(Some(3_600));
        original.set_dts(Some(1_800));
        original.set_index(2);

        let shared = original.clone();
        assert_eq!(shared.pts(), Some(3_600));
        assert_eq!(shared.dts(), Some(1_800));
        assert_eq!(shared.index(), 2);
        assert_eq!(shared.time_base(), Rational::new(1, 90_000));
        assert_eq!(shared.data().as_ptr(), original.data().as_ptr());
    }

    #[test]
    fn test_rescale_ts_updates_time_base() {
        let mut packet = Packet::copy(&[0u8; 8], Rational::new(1, 24));
        packet.set_pts(Some(48));
        packet.set_dts(Some(24));
        packet.set_duration(1);

        packet.rescale_ts(Rational::new(1, 48_000));
        assert_eq!(packet.pts(), Some(96_000));
        assert_eq!(packet.dts(), Some(48_000));
        assert_eq!(packet.duration(), 2_000);
        assert_eq!(packet.time_base(), Rational::new(1, 48_000));
    }
}
