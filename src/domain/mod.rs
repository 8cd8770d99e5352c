// Domain layer: result records and ports (interfaces). No process or filesystem code here.

pub mod model;
pub mod ports;
