mod file;
mod mirror;
mod phys;
