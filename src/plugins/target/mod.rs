pub mod csr;
pub mod manual;
