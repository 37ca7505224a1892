//! 二维码导入层
//!
//! 消费解码完成的传输载荷，写入本地存储：
//! - [`registry`]：传输台账（永久去重）
//! - [`boat_importer`]：船只档案导入（查重 → 更新或新建）
//! - [`trip_importer`]：航程批量导入（重叠检测 → 逐条原子落库）

pub mod boat_importer;
pub mod registry;
pub mod trip_importer;

pub use boat_importer::{BoatImportMode, BoatImporter};
pub use registry::ImportRecord;
pub use trip_importer::TripImporter;
