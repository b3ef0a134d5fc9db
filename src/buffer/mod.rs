pub mod byte;
pub mod ring;

pub use byte::ByteBuffer;
pub use ring::CircularBuffer;
