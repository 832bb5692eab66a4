pub mod blocks;
pub mod decoder;
pub mod rpc;
pub mod scanner;

#[cfg(test)]
pub mod testing;
