use ffmpeg_next::{
    Rational,
    codec::{Id, Parameters},
    format::stream,
    media,
    util::mathematics::Rescale,
};

unsafe impl Send for StreamDescriptor {}
unsafe impl Sync for StreamDescriptor {}

/// Codec parameters plus the native time base of one discovered stream.
/// Immutable once the demuxer has produced it.
pub struct StreamDescriptor {
    index: usize,
    parameters: Parameters,
    time_base: Rational,
    rate: Rational,
}

impl StreamDescriptor {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    /// Average frame rate as reported by the container; 0/0 when unknown.
    pub fn rate(&self) -> Rational {
        self.rate
    }

    pub fn medium(&self) -> media::Type {
        self.parameters.medium()
    }

    pub fn codec_id(&self) -> Id {
        self.parameters.id()
    }

    pub fn is_video(&self) -> bool {
        self.medium() == media::Type::Video
    }

    pub fn is_audio(&self) -> bool {
        self.medium() == media::Type::Audio
    }

    pub fn width(&self) -> u32 {
        unsafe { (*self.parameters.as_ptr()).width.max(0) as u32 }
    }

    pub fn height(&self) -> u32 {
        unsafe { (*self.parameters.as_ptr()).height.max(0) as u32 }
    }

    pub fn sample_rate(&self) -> u32 {
        unsafe { (*self.parameters.as_ptr()).sample_rate.max(0) as u32 }
    }

    pub fn channels(&self) -> u32 {
        unsafe { (*self.parameters.as_ptr()).ch_layout.nb_channels.max(0) as u32 }
    }
}

impl From<stream::Stream<'_>> for StreamDescriptor {
    fn from(stream: stream::Stream<'_>) -> Self {
        Self {
            index: stream.index(),
            parameters: stream.parameters(),
            time_base: stream.time_base(),
            rate: stream.avg_frame_rate(),
        }
    }
}

impl Clone for StreamDescriptor {
    fn clone(&self) -> Self {
        Self {
            index: self.index,
            parameters: self.parameters.clone(),
            time_base: self.time_base,
            rate: self.rate,
        }
    }
}

impl std::fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("index", &self.index)
            .field("codec", &self.codec_id())
            .field("medium", &self.medium())
            .field("time_base", &self.time_base)
            .field("rate", &self.rate)
            .finish()
    }
}

/// Codec parameters for an elementary stream known only by its codec id,
/// e.g. a raw `.h264` byte stream without a container.
pub fn elementary_parameters(id: Id) -> Parameters {
    let mut parameters = Parameters::new();
    let medium = ffmpeg_next::decoder::find(id)
        .map(|codec| codec.medium())
        .unwrap_or(media::Type::Unknown);
    unsafe {
        let ptr = parameters.as_mut_ptr();
        (*ptr).codec_type = medium.into();
        (*ptr).codec_id = id.into();
    }
    parameters
}

/// Converts `value` from `from` ticks to `to` ticks, rounding to nearest.
pub fn rescale(value: i64, from: Rational, to: Rational) -> i64 {
    value.rescale(from, to)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rescale_exact_round_trip() {
        let film = Rational::new(1, 24);
        let seconds = Rational::new(1, 1);
        assert_eq!(rescale(24, film, seconds), 1);
        assert_eq!(rescale(1, seconds, film), 24);
        assert_eq!(rescale(rescale(48, film, seconds), seconds, film), 48);
    }

    #[test]
    fn test_rescale_between_container_bases() {
        let mpegts = Rational::new(1, 90_000);
        let matroska = Rational::new(1, 1_000);
        assert_eq!(rescale(180_000, mpegts, matroska), 2_000);
        assert_eq!(rescale(2_000, matroska, mpegts), 180_000);
    }

    #[test]
    fn test_elementary_parameters() {
        crate::init().unwrap();
        let parameters = elementary_parameters(Id::MPEG4);
        assert_eq!(parameters.id(), Id::MPEG4);
        assert_eq!(parameters.medium(), media::Type::Video);
    }
}
