pub mod body;
pub mod bounds;
pub mod broadphase;
pub mod config;
pub mod constraints;
pub mod contact;
pub mod dbvt;
pub mod error;
pub mod island;
pub mod manifold;
pub mod pair_cache;
pub mod scene;
pub mod solver;
