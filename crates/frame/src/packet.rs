/// One element of a frame stream: either a payload or the in-band
/// end-of-stream marker. End-of-stream is sent at most once per stream
/// and always after the last payload.
#[derive(Debug)]
pub enum Packet<T> {
    Payload(T),
    EndOfStream,
}

impl<T> Packet<T> {
    pub fn is_end_of_stream(&self) -> bool {
        matches!(self, Packet::EndOfStream)
    }

    pub fn payload(self) -> Option<T> {
        match self {
            Packet::Payload(value) => Some(value),
            Packet::EndOfStream => None,
        }
    }

    pub fn payload_ref(&self) -> Option<&T> {
        match self {
            Packet::Payload(value) => Some(value),
            Packet::EndOfStream => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Packet<U> {
        match self {
            Packet::Payload(value) => Packet::Payload(f(value)),
            Packet::EndOfStream => Packet::EndOfStream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_preserves_end_of_stream() {
        let p: Packet<u32> = Packet::Payload(21);
        assert_eq!(p.map(|v| v * 2).payload(), Some(42));

        let eos: Packet<u32> = Packet::EndOfStream;
        assert!(eos.map(|v| v * 2).is_end_of_stream());
    }
}
