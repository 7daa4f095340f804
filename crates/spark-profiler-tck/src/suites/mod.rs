pub(crate) mod equality;
pub(crate) mod lifecycle;
pub(crate) mod round_trip;
