// Services that sit in front of the wallet core

pub mod admission_policy;
