pub mod extxyz;
